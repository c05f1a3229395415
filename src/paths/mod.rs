// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The signal-path manager: builds and indexes the transformation chains
//! experienced by each class of observation, and manages the time
//! segmentation of the receiver backend.
//!
//! The standard decomposition is a segmented backend (absolute gain,
//! differential gain and differential phase, independent per time segment)
//! followed by the receptor geometry of the frontend (an orientation
//! rotation about the V axis and an ellipticity rotation about the U
//! axis). The frontend is shared by every path; the target and flux
//! calibrator see the full instrument plus the sky projection supplied per
//! measurement set, while the reference calibrator signal is injected
//! after the sky and optionally bypasses the frontend.
//!
//! One [BackendEstimate] shadows each backend segment; integrated
//! calibrator solutions seed the segment parameters before a fit.

mod error;

pub use error::PathError;

use hifitime::Epoch;
use log::{debug, warn};

use crate::coherency::Stokes;
use crate::equation::MeasurementEquation;
use crate::estimate::BackendEstimate;
use crate::math::average_epoch;
use crate::model::{ModelArena, NodeId, StokesAxis, TimePolynomial};

/// The class of an observation, determining which signal path it
/// constrains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObsClass {
    /// The astronomical target (unknown polarization).
    Target,

    /// The artificial reference calibrator signal.
    ReferenceCalibrator,

    /// The flux calibrator source (on- or off-source).
    FluxCalibrator,
}

/// Configuration for the standard signal-path model.
#[derive(Clone, Debug)]
pub struct SignalPathConfig {
    /// Whether the reference calibrator signal passes through the frontend
    /// (receptor geometry) or only the backend.
    pub refcal_through_frontend: bool,

    /// Hold the backend's absolute gain fixed (e.g. when the target Stokes
    /// parameters have been normalized).
    pub constant_gain: bool,
}

impl Default for SignalPathConfig {
    fn default() -> SignalPathConfig {
        SignalPathConfig {
            refcal_through_frontend: true,
            constant_gain: false,
        }
    }
}

/// Builds and owns a per-channel measurement equation. See the
/// [module docs](self).
#[derive(Clone, Debug)]
pub struct SignalPathManager {
    equation: MeasurementEquation,

    /// The segmented backend.
    segmented: NodeId,

    /// The Bound wrapper through which backend parameters may vary with
    /// time.
    backend_chain: NodeId,

    feed_orientation: NodeId,
    feed_ellipticity: NodeId,

    /// Product of backend chain and frontend.
    instrument: NodeId,

    target_path: usize,
    refcal_path: Option<usize>,
    fluxcal_path: Option<usize>,

    refcal_through_frontend: bool,

    /// One estimate per backend segment, in segment order.
    estimates: Vec<BackendEstimate>,

    min_epoch: Option<Epoch>,
    max_epoch: Option<Epoch>,
}

impl SignalPathManager {
    /// Build the standard model and register the target path.
    pub fn new(config: &SignalPathConfig) -> Result<SignalPathManager, PathError> {
        let mut equation = MeasurementEquation::new();
        let arena = equation.arena_mut();

        let backend = arena.add_backend();
        let segmented = arena.add_segmented(backend)?;
        let backend_chain = arena.add_bound(segmented)?;
        let feed_orientation = arena.add_rotation(StokesAxis::V);
        let feed_ellipticity = arena.add_rotation(StokesAxis::U);
        let instrument =
            arena.add_product(vec![backend_chain, feed_orientation, feed_ellipticity])?;
        if config.constant_gain {
            arena.set_infit(backend, 0, false)?;
        }

        let target_path = equation.add_transformation(instrument)?;
        debug!("target path registered as {target_path}");

        let mut manager = SignalPathManager {
            equation,
            segmented,
            backend_chain,
            feed_orientation,
            feed_ellipticity,
            instrument,
            target_path,
            refcal_path: None,
            fluxcal_path: None,
            refcal_through_frontend: config.refcal_through_frontend,
            estimates: vec![],
            min_epoch: None,
            max_epoch: None,
        };
        manager.sync_estimates()?;
        Ok(manager)
    }

    pub fn equation(&self) -> &MeasurementEquation {
        &self.equation
    }

    pub fn equation_mut(&mut self) -> &mut MeasurementEquation {
        &mut self.equation
    }

    /// Give up the manager, keeping the equation (e.g. to hand it to a
    /// [Channel](crate::scheduler::Channel)).
    pub fn into_equation(self) -> MeasurementEquation {
        self.equation
    }

    fn arena(&self) -> &ModelArena {
        self.equation.arena()
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Paths and input states
    //
    // ///////////////////////////////////////////////////////////////////

    /// The path index for an observation class. The calibrator paths exist
    /// only once their `add_*` method has been called.
    pub fn path_index(&self, class: ObsClass) -> Result<usize, PathError> {
        match class {
            ObsClass::Target => Ok(self.target_path),
            ObsClass::ReferenceCalibrator => self.refcal_path.ok_or(PathError::MissingPath {
                what: "reference calibrator",
            }),
            ObsClass::FluxCalibrator => self.fluxcal_path.ok_or(PathError::MissingPath {
                what: "flux calibrator",
            }),
        }
    }

    /// Register the reference calibrator path: the backend chain, plus the
    /// frontend if so configured.
    pub fn add_refcal_path(&mut self) -> Result<usize, PathError> {
        if let Some(index) = self.refcal_path {
            return Ok(index);
        }
        let root = if self.refcal_through_frontend {
            self.instrument
        } else {
            self.backend_chain
        };
        let index = self.equation.add_transformation(root)?;
        self.refcal_path = Some(index);
        debug!("reference calibrator path registered as {index}");
        Ok(index)
    }

    /// Register the flux calibrator path: the full instrument (the sky
    /// projection arrives with each measurement set's coordinates).
    pub fn add_fluxcal_path(&mut self) -> Result<usize, PathError> {
        if let Some(index) = self.fluxcal_path {
            return Ok(index);
        }
        let index = self.equation.add_transformation(self.instrument)?;
        self.fluxcal_path = Some(index);
        debug!("flux calibrator path registered as {index}");
        Ok(index)
    }

    /// Register `count` unknown target states (e.g. pulsar phase bins),
    /// seeded unpolarized.
    pub fn add_target_states(&mut self, count: usize) -> Result<Vec<usize>, PathError> {
        let mut indices = Vec::with_capacity(count);
        for _ in 0..count {
            indices.push(self.equation.add_input(Stokes([1.0, 0.0, 0.0, 0.0]))?);
        }
        Ok(indices)
    }

    /// Register the reference calibrator state. The ideal noise diode
    /// illuminates both receptors equally and in phase (100% U in the
    /// receptor basis); its actual state is usually left free.
    pub fn add_refcal_state(&mut self) -> Result<usize, PathError> {
        Ok(self.equation.add_input(Stokes([1.0, 0.0, 1.0, 0.0]))?)
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Time segmentation
    //
    // ///////////////////////////////////////////////////////////////////

    /// Insert a backend segment boundary at `epoch` (idempotent). The new
    /// segment is seeded with the parameters active before the insertion
    /// point.
    pub fn add_step(&mut self, epoch: Epoch) -> Result<bool, PathError> {
        let inserted = self.equation.arena_mut().add_step(self.segmented, epoch)?;
        if inserted {
            self.sync_estimates()?;
        }
        Ok(inserted)
    }

    pub fn num_segments(&self) -> Result<usize, PathError> {
        Ok(self.arena().num_segments(self.segmented)?)
    }

    /// The backend segment covering `epoch`.
    pub fn get_segment(&self, epoch: Epoch) -> Result<(usize, NodeId), PathError> {
        Ok(self.arena().segment_at(self.segmented, epoch)?)
    }

    /// Rebuild the estimate list after segmentation changes, keeping any
    /// accumulated data for segments that survived.
    fn sync_estimates(&mut self) -> Result<(), PathError> {
        let arena = self.equation.arena();
        let num_segments = arena.num_segments(self.segmented)?;
        let mut estimates = Vec::with_capacity(num_segments);
        for segment in 0..num_segments {
            let node = arena.segment_node(self.segmented, segment)?;
            let (start, end) = arena.segment_span(self.segmented, segment)?;
            let mut estimate = match self.estimates.iter().find(|e| e.target() == node) {
                Some(existing) => existing.clone(),
                None => BackendEstimate::new(arena, node)?,
            };
            estimate.set_span(start, end);
            estimates.push(estimate);
        }
        self.estimates = estimates;
        Ok(())
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Estimators
    //
    // ///////////////////////////////////////////////////////////////////

    /// Integrate an observed calibrator solution into the estimate for the
    /// segment spanning `epoch`.
    pub fn integrate_calibrator(
        &mut self,
        epoch: Epoch,
        observed: &ModelArena,
        node: NodeId,
    ) -> Result<(), PathError> {
        self.add_observation_epoch(epoch);
        let estimate = self
            .estimates
            .iter_mut()
            .find(|e| e.spans(epoch))
            .ok_or(PathError::NoSpanningEstimate { epoch })?;
        estimate.integrate(observed, node, epoch)?;
        Ok(())
    }

    /// Write every constrained estimate into its backend segment as an
    /// initial guess. Returns the indices of segments whose estimate could
    /// not produce a guess; the caller decides whether that invalidates
    /// the channel.
    pub fn update(&mut self) -> Result<Vec<usize>, PathError> {
        let mut unconstrained = vec![];
        for (segment, estimate) in self.estimates.iter().enumerate() {
            if estimate.is_constrained() {
                estimate.update(self.equation.arena_mut())?;
            } else {
                warn!(
                    "backend segment {segment} is unconstrained ({} attempts, {} failures)",
                    estimate.attempts(),
                    estimate.failures()
                );
                unconstrained.push(segment);
            }
        }
        Ok(unconstrained)
    }

    pub fn estimates(&self) -> &[BackendEstimate] {
        &self.estimates
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Free-flag controls
    //
    // ///////////////////////////////////////////////////////////////////

    /// Set the free flag of one backend parameter across every segment.
    fn fit_backend_param(&mut self, iparam: usize, flag: bool) -> Result<(), PathError> {
        let num_segments = self.num_segments()?;
        for segment in 0..num_segments {
            let node = self.segment_node(segment)?;
            self.equation.arena_mut().set_infit(node, iparam, flag)?;
        }
        Ok(())
    }

    fn segment_node(&self, segment: usize) -> Result<NodeId, PathError> {
        let arena = self.arena();
        let num_segments = arena.num_segments(self.segmented)?;
        if segment >= num_segments {
            return Err(PathError::SegmentIndex {
                segment,
                nsegments: num_segments,
            });
        }
        Ok(arena.segment_node(self.segmented, segment)?)
    }

    pub fn fit_gain(&mut self, flag: bool) -> Result<(), PathError> {
        self.fit_backend_param(0, flag)
    }

    pub fn fit_diff_gain(&mut self, flag: bool) -> Result<(), PathError> {
        self.fit_backend_param(1, flag)
    }

    pub fn fit_diff_phase(&mut self, flag: bool) -> Result<(), PathError> {
        self.fit_backend_param(2, flag)
    }

    /// Fix (or free) the receptor orientation, e.g. when it is degenerate
    /// with the unknown target polarization.
    pub fn fit_orientation(&mut self, flag: bool) -> Result<(), PathError> {
        Ok(self
            .equation
            .arena_mut()
            .set_infit(self.feed_orientation, 0, flag)?)
    }

    pub fn fit_ellipticity(&mut self, flag: bool) -> Result<(), PathError> {
        Ok(self
            .equation
            .arena_mut()
            .set_infit(self.feed_ellipticity, 0, flag)?)
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Time variation
    //
    // ///////////////////////////////////////////////////////////////////

    /// Bind one backend parameter of one segment to a polynomial of time;
    /// the parameter leaves the fit and the polynomial coefficients join
    /// it.
    ///
    /// Bindings address segments by their position at bind time, so add
    /// every segment boundary before binding.
    pub fn set_backend_variation(
        &mut self,
        segment: usize,
        iparam: usize,
        poly: TimePolynomial,
    ) -> Result<(), PathError> {
        if iparam >= 3 {
            return Err(PathError::BackendParamIndex { iparam, nparam: 3 });
        }
        self.segment_node(segment)?;
        let flat = 3 * segment + iparam;
        Ok(self
            .equation
            .arena_mut()
            .bind(self.backend_chain, flat, poly)?)
    }

    /// Remove a binding added by
    /// [set_backend_variation](Self::set_backend_variation).
    pub fn clear_backend_variation(
        &mut self,
        segment: usize,
        iparam: usize,
    ) -> Result<(), PathError> {
        let flat = 3 * segment + iparam;
        Ok(self.equation.arena_mut().unbind(self.backend_chain, flat)?)
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Epoch bookkeeping
    //
    // ///////////////////////////////////////////////////////////////////

    /// Track the span of integrated observations.
    pub fn add_observation_epoch(&mut self, epoch: Epoch) {
        if self.min_epoch.map_or(true, |min| epoch < min) {
            self.min_epoch = Some(epoch);
        }
        if self.max_epoch.map_or(true, |max| epoch > max) {
            self.max_epoch = Some(epoch);
        }
    }

    /// The midpoint of the observed span, a natural reference epoch for
    /// time polynomials.
    pub fn reference_epoch(&self) -> Option<Epoch> {
        match (self.min_epoch, self.max_epoch) {
            (Some(min), Some(max)) => Some(average_epoch([min, max])),
            _ => None,
        }
    }

    /// Copy every fitted value from another (structurally identical)
    /// manager, e.g. a well-converged neighboring channel.
    pub fn copy_fit_from(&mut self, other: &SignalPathManager) -> Result<(), PathError> {
        Ok(self.equation.copy_fit_from(&other.equation)?)
    }
}
