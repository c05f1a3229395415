// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Running-mean estimators that seed initial parameter guesses.
//!
//! A [SourceEstimate] accumulates prior measurements of an unknown input
//! polarization state; a [BackendEstimate] accumulates observed backend
//! solutions for one time segment. Both are consumed once at
//! solve-preparation time: `update` writes the accumulated mean (and its
//! uncertainty) into the model as an initial guess.
//!
//! Accumulation rules are per transformation kind: gains and boosts average
//! arithmetically, but phase-like parameters (differential phase, axis
//! rotations) wrap modulo 2π and use a circular mean. Attempts and failures
//! are counted separately so a systematic failure rate can be reported
//! without treating an occasional transient failure as fatal.

mod error;

pub use error::EstimateError;

use hifitime::Epoch;
use log::debug;

use crate::coherency::Stokes;
use crate::equation::MeasurementEquation;
use crate::math::{CircularMean, WeightedMean};
use crate::model::{ModelArena, NodeId, NodeSpec, TransformKind};

/// Which parameters of an elementary kind wrap modulo 2π.
fn cyclic_params(kind: TransformKind) -> Result<&'static [bool], EstimateError> {
    match kind {
        TransformKind::Gain => Ok(&[false]),
        TransformKind::DiffGainPhase => Ok(&[false, false, true]),
        TransformKind::AxisRotation => Ok(&[true]),
        TransformKind::AxisBoost => Ok(&[false]),
        TransformKind::Product | TransformKind::Segmented | TransformKind::Bound => {
            Err(EstimateError::NotElementary { kind })
        }
    }
}

/// A running mean with the accumulation rule appropriate to the parameter.
#[derive(Clone, Copy, Debug)]
enum MeanKind {
    Linear(WeightedMean),
    Cyclic(CircularMean),
}

impl MeanKind {
    fn new(cyclic: bool) -> MeanKind {
        if cyclic {
            MeanKind::Cyclic(CircularMean::default())
        } else {
            MeanKind::Linear(WeightedMean::default())
        }
    }

    fn integrate(&mut self, value: f64, weight: f64) {
        match self {
            MeanKind::Linear(mean) => mean.integrate(value, weight),
            MeanKind::Cyclic(mean) => mean.integrate(value, weight),
        }
    }

    fn get(&self) -> Option<(f64, f64)> {
        match self {
            MeanKind::Linear(mean) => mean.get(),
            MeanKind::Cyclic(mean) => mean.get(),
        }
    }
}

fn weight_of(variance: f64) -> f64 {
    if variance > 0.0 {
        1.0 / variance
    } else {
        1.0
    }
}

/// The running mean of an unknown input polarization state.
#[derive(Clone, Debug)]
pub struct SourceEstimate {
    input_index: usize,
    means: [WeightedMean; 4],
    attempts: u32,
    failures: u32,
}

impl SourceEstimate {
    pub fn new(input_index: usize) -> SourceEstimate {
        SourceEstimate {
            input_index,
            means: [WeightedMean::default(); 4],
            attempts: 0,
            failures: 0,
        }
    }

    pub fn input_index(&self) -> usize {
        self.input_index
    }

    /// Accumulate one prior measurement of the state. A non-finite
    /// component or negative variance discards the sample and counts a
    /// failure.
    pub fn integrate(&mut self, stokes: Stokes, variance: [f64; 4]) -> Result<(), EstimateError> {
        self.attempts += 1;
        for k in 0..4 {
            if !stokes[k].is_finite() || variance[k] < 0.0 {
                self.failures += 1;
                return Err(EstimateError::NonFinite {
                    iparam: k,
                    value: stokes[k],
                });
            }
        }
        for k in 0..4 {
            self.means[k].integrate(stokes[k], weight_of(variance[k]));
        }
        Ok(())
    }

    /// True only if at least one integration succeeded.
    pub fn is_constrained(&self) -> bool {
        !self.means[0].is_empty()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Write the accumulated mean and its uncertainty into the equation's
    /// input state as an initial guess.
    pub fn update(&self, equation: &mut MeasurementEquation) -> Result<(), EstimateError> {
        if !self.is_constrained() {
            return Err(EstimateError::Unconstrained {
                attempts: self.attempts,
                failures: self.failures,
            });
        }
        for k in 0..4 {
            let (value, variance) = self.means[k].get().expect("estimate is constrained");
            let index = equation.input_param_index(self.input_index, k)?;
            equation.set_param(index, value)?;
            equation.set_variance(index, variance)?;
        }
        debug!(
            "seeded input {} from {} integrations ({} failures)",
            self.input_index, self.attempts, self.failures
        );
        Ok(())
    }
}

/// The running mean of one elementary transformation, usually the backend
/// copy belonging to one time segment.
#[derive(Clone, Debug)]
pub struct BackendEstimate {
    /// The node this estimate seeds.
    target: NodeId,

    kind: TransformKind,
    means: Vec<MeanKind>,

    /// The period spanned by this estimate; `None` bounds are open.
    start: Option<Epoch>,
    end: Option<Epoch>,

    attempts: u32,
    failures: u32,
}

impl BackendEstimate {
    /// An estimate seeding `target`, which must be an elementary node.
    pub fn new(arena: &ModelArena, target: NodeId) -> Result<BackendEstimate, EstimateError> {
        let kind = arena.kind(target)?;
        let cyclic = cyclic_params(kind)?;
        Ok(BackendEstimate {
            target,
            kind,
            means: cyclic.iter().map(|&c| MeanKind::new(c)).collect(),
            start: None,
            end: None,
            attempts: 0,
            failures: 0,
        })
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn set_span(&mut self, start: Option<Epoch>, end: Option<Epoch>) {
        self.start = start;
        self.end = end;
    }

    /// True if this estimate's period covers `epoch` (half-open, like the
    /// segments it shadows).
    pub fn spans(&self, epoch: Epoch) -> bool {
        self.start.map_or(true, |start| epoch >= start) && self.end.map_or(true, |end| epoch < end)
    }

    /// Accumulate parameter values observed for this backend, with their
    /// variances as weights.
    pub fn integrate_params(
        &mut self,
        kind: TransformKind,
        values: &[f64],
        variances: &[f64],
    ) -> Result<(), EstimateError> {
        self.attempts += 1;
        if kind != self.kind {
            self.failures += 1;
            return Err(EstimateError::KindMismatch {
                expected: self.kind,
                found: kind,
            });
        }
        if values.len() != self.means.len() || variances.len() != self.means.len() {
            self.failures += 1;
            return Err(EstimateError::ParamCount {
                kind,
                expected: self.means.len(),
                got: values.len(),
            });
        }
        for (iparam, &value) in values.iter().enumerate() {
            if !value.is_finite() {
                self.failures += 1;
                return Err(EstimateError::NonFinite { iparam, value });
            }
        }
        for (iparam, mean) in self.means.iter_mut().enumerate() {
            mean.integrate(values[iparam], weight_of(variances[iparam]));
        }
        Ok(())
    }

    /// Accumulate an observed transformation, searching through composite
    /// nodes for a component of the matching kind: products are searched
    /// member by member, a segmented node contributes the segment spanning
    /// `epoch`, and a bound node contributes its inner transformation.
    pub fn integrate(
        &mut self,
        arena: &ModelArena,
        node: NodeId,
        epoch: Epoch,
    ) -> Result<(), EstimateError> {
        match self.find_component(arena, node, epoch)? {
            Some(component) => {
                let nparam = arena.nparam(component)?;
                let mut values = Vec::with_capacity(nparam);
                let mut variances = Vec::with_capacity(nparam);
                for iparam in 0..nparam {
                    values.push(arena.get_param(component, iparam)?);
                    variances.push(arena.get_variance(component, iparam)?);
                }
                self.integrate_params(self.kind, &values, &variances)
            }
            None => {
                self.attempts += 1;
                self.failures += 1;
                Err(EstimateError::KindMismatch {
                    expected: self.kind,
                    found: arena.kind(node)?,
                })
            }
        }
    }

    fn find_component(
        &self,
        arena: &ModelArena,
        node: NodeId,
        epoch: Epoch,
    ) -> Result<Option<NodeId>, EstimateError> {
        match arena.spec(node)? {
            NodeSpec::Gain
            | NodeSpec::DiffGainPhase
            | NodeSpec::AxisRotation(_)
            | NodeSpec::AxisBoost(_) => {
                if arena.kind(node)? == self.kind {
                    Ok(Some(node))
                } else {
                    Ok(None)
                }
            }
            NodeSpec::Product(members) => {
                for &member in members.iter() {
                    if let Some(found) = self.find_component(arena, member, epoch)? {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
            NodeSpec::Segmented { .. } => {
                let (_, active) = arena.segment_at(node, epoch)?;
                self.find_component(arena, active, epoch)
            }
            NodeSpec::Bound { inner, .. } => self.find_component(arena, *inner, epoch),
        }
    }

    /// True only if at least one integration succeeded.
    pub fn is_constrained(&self) -> bool {
        self.means.first().map_or(false, |mean| mean.get().is_some())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Write the accumulated means and their uncertainties into the target
    /// node as an initial guess.
    pub fn update(&self, arena: &mut ModelArena) -> Result<(), EstimateError> {
        if !self.is_constrained() {
            return Err(EstimateError::Unconstrained {
                attempts: self.attempts,
                failures: self.failures,
            });
        }
        for (iparam, mean) in self.means.iter().enumerate() {
            let (value, variance) = mean.get().expect("estimate is constrained");
            arena.set_param(self.target, iparam, value)?;
            arena.set_variance(self.target, iparam, variance)?;
        }
        debug!(
            "seeded {} node {} from {} integrations ({} failures)",
            self.kind, self.target.0, self.attempts, self.failures
        );
        Ok(())
    }
}
