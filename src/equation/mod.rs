// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-channel measurement equation: signal paths, input states and the
//! measurements that constrain them.
//!
//! A [MeasurementEquation] owns the transformation arena, the registered
//! signal paths, the unknown input polarization states, and every
//! measurement set for one frequency channel. It has no behavior beyond
//! indexed composition: [MeasurementEquation::evaluate] selects an input
//! state and a path, applies the set's known coordinates, and returns the
//! predicted Stokes parameters together with the gradient of the prediction
//! with respect to every global parameter.
//!
//! Parameters are addressed by a single flat index: the four Stokes
//! parameters of each input state first, then the arena's parameters in
//! node order. The layout is stable once the model is built; building is
//! over when solving begins, after which structural additions are refused.

mod error;
#[cfg(test)]
mod tests;

pub use error::EquationError;

use log::trace;
use marlu::Jones;

use crate::coherency::{CoherencyMeasurementSet, Coordinates, Stokes};
use crate::model::{ModelArena, NodeId, Parameter};

/// An unknown input polarization state: a free Stokes 4-vector.
#[derive(Clone, Debug)]
pub struct InputState {
    params: [Parameter; 4],
}

impl InputState {
    fn new(stokes: Stokes) -> InputState {
        InputState {
            params: stokes.0.map(|value| Parameter {
                value,
                variance: 0.0,
                free: true,
            }),
        }
    }

    pub fn stokes(&self) -> Stokes {
        Stokes([
            self.params[0].value,
            self.params[1].value,
            self.params[2].value,
            self.params[3].value,
        ])
    }

    pub fn variances(&self) -> [f64; 4] {
        [
            self.params[0].variance,
            self.params[1].variance,
            self.params[2].variance,
            self.params[3].variance,
        ]
    }
}

/// The measurement equation for one frequency channel. See the
/// [module docs](self).
#[derive(Clone, Debug, Default)]
pub struct MeasurementEquation {
    arena: ModelArena,
    paths: Vec<NodeId>,
    inputs: Vec<InputState>,
    data: Vec<CoherencyMeasurementSet>,
    solving_started: bool,
}

impl MeasurementEquation {
    pub fn new() -> MeasurementEquation {
        MeasurementEquation::default()
    }

    pub fn arena(&self) -> &ModelArena {
        &self.arena
    }

    /// Mutable access to the transformation arena, for model construction
    /// and for writing initial guesses and fitted values.
    pub fn arena_mut(&mut self) -> &mut ModelArena {
        &mut self.arena
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Model construction
    //
    // ///////////////////////////////////////////////////////////////////

    /// Register a transformation as a signal path and return its index.
    pub fn add_transformation(&mut self, root: NodeId) -> Result<usize, EquationError> {
        if self.solving_started {
            return Err(EquationError::SolvingStarted {
                what: "a signal path",
            });
        }
        // An unregistered node is the caller's error.
        self.arena.kind(root)?;
        self.paths.push(root);
        Ok(self.paths.len() - 1)
    }

    /// Register an unknown input state, seeded with `stokes`, and return
    /// its index.
    pub fn add_input(&mut self, stokes: Stokes) -> Result<usize, EquationError> {
        if self.solving_started {
            return Err(EquationError::SolvingStarted {
                what: "an input state",
            });
        }
        self.inputs.push(InputState::new(stokes));
        Ok(self.inputs.len() - 1)
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn path(&self, index: usize) -> Result<NodeId, EquationError> {
        self.paths
            .get(index)
            .copied()
            .ok_or(EquationError::PathIndex {
                index,
                num_paths: self.paths.len(),
            })
    }

    pub fn input(&self, index: usize) -> Result<&InputState, EquationError> {
        self.inputs.get(index).ok_or(EquationError::InputIndex {
            index,
            num_inputs: self.inputs.len(),
        })
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Data
    //
    // ///////////////////////////////////////////////////////////////////

    /// Append a measurement set. Indices and variances are validated here,
    /// before the set is accepted, so a malformed set is rejected at the
    /// call site rather than surfacing during a later solve.
    pub fn add_data(&mut self, set: CoherencyMeasurementSet) -> Result<(), EquationError> {
        if set.path_index >= self.paths.len() {
            return Err(EquationError::PathIndex {
                index: set.path_index,
                num_paths: self.paths.len(),
            });
        }
        for measurement in set.measurements() {
            if measurement.input_index >= self.inputs.len() {
                return Err(EquationError::InputIndex {
                    index: measurement.input_index,
                    num_inputs: self.inputs.len(),
                });
            }
            for (component, &variance) in measurement.variance.iter().enumerate() {
                if variance < 0.0 {
                    return Err(EquationError::NegativeVariance {
                        input_index: measurement.input_index,
                        component,
                        variance,
                    });
                }
            }
        }
        self.data.push(set);
        Ok(())
    }

    pub fn get_ndata(&self) -> usize {
        self.data.len()
    }

    pub fn get_data(&self, index: usize) -> Result<&CoherencyMeasurementSet, EquationError> {
        self.data.get(index).ok_or(EquationError::DataIndex {
            index,
            ndata: self.data.len(),
        })
    }

    pub(crate) fn data(&self) -> &[CoherencyMeasurementSet] {
        &self.data
    }

    /// Delete all measurement sets so the model can be reused against new
    /// data. This also reopens the equation for structural additions.
    pub fn delete_data(&mut self) {
        self.data.clear();
        self.solving_started = false;
    }

    /// Called by the solver when iteration begins; from here on the set of
    /// paths and input states is frozen.
    pub(crate) fn begin_solve(&mut self) {
        self.solving_started = true;
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Global parameter access
    //
    // ///////////////////////////////////////////////////////////////////

    /// The total number of parameters: four per input state, then every
    /// arena parameter.
    pub fn get_nparam(&self) -> usize {
        4 * self.inputs.len() + self.arena.nparam_total()
    }

    fn input_params(&self) -> usize {
        4 * self.inputs.len()
    }

    fn check_index(&self, index: usize) -> Result<(), EquationError> {
        if index >= self.get_nparam() {
            return Err(EquationError::ParamIndex {
                index,
                nparam: self.get_nparam(),
            });
        }
        Ok(())
    }

    pub fn get_param(&self, index: usize) -> Result<f64, EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            Ok(self.inputs[index / 4].params[index % 4].value)
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.get_param(node, iparam)?)
        }
    }

    pub fn set_param(&mut self, index: usize, value: f64) -> Result<(), EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            self.inputs[index / 4].params[index % 4].value = value;
            Ok(())
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.set_param(node, iparam, value)?)
        }
    }

    pub fn get_variance(&self, index: usize) -> Result<f64, EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            Ok(self.inputs[index / 4].params[index % 4].variance)
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.get_variance(node, iparam)?)
        }
    }

    pub fn set_variance(&mut self, index: usize, variance: f64) -> Result<(), EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            self.inputs[index / 4].params[index % 4].variance = variance;
            Ok(())
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.set_variance(node, iparam, variance)?)
        }
    }

    pub fn get_infit(&self, index: usize) -> Result<bool, EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            Ok(self.inputs[index / 4].params[index % 4].free)
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.get_infit(node, iparam)?)
        }
    }

    pub fn set_infit(&mut self, index: usize, free: bool) -> Result<(), EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            self.inputs[index / 4].params[index % 4].free = free;
            Ok(())
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.set_infit(node, iparam, free)?)
        }
    }

    pub fn param_name(&self, index: usize) -> Result<String, EquationError> {
        self.check_index(index)?;
        if index < self.input_params() {
            let stokes = ["I", "Q", "U", "V"][index % 4];
            Ok(format!("input{}.{stokes}", index / 4))
        } else {
            let (node, iparam) = self.arena.locate(index - self.input_params())?;
            Ok(self.arena.param_name(node, iparam)?)
        }
    }

    /// Set the free flag of every Stokes parameter of one input state; e.g.
    /// a reference source of known polarization is held fixed.
    pub fn set_input_infit(&mut self, index: usize, free: bool) -> Result<(), EquationError> {
        if index >= self.inputs.len() {
            return Err(EquationError::InputIndex {
                index,
                num_inputs: self.inputs.len(),
            });
        }
        for param in self.inputs[index].params.iter_mut() {
            param.free = free;
        }
        Ok(())
    }

    /// The global parameter index of the k-th Stokes parameter of an input.
    pub fn input_param_index(&self, input_index: usize, k: usize) -> Result<usize, EquationError> {
        self.input(input_index)?;
        Ok(4 * input_index + k)
    }

    /// The global parameter index of a node parameter.
    pub fn node_param_index(&self, node: NodeId, iparam: usize) -> Result<usize, EquationError> {
        Ok(self.input_params() + self.arena.param_offset(node)? + iparam)
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Evaluation
    //
    // ///////////////////////////////////////////////////////////////////

    /// Predict the Stokes parameters observed through a signal path for one
    /// input state, and optionally the gradient of the prediction with
    /// respect to every global parameter (zero for parameters the path does
    /// not touch).
    pub fn evaluate(
        &self,
        path_index: usize,
        input_index: usize,
        coordinates: &Coordinates,
        want_gradient: bool,
    ) -> Result<(Stokes, Option<Vec<Stokes>>), EquationError> {
        let root = self.path(path_index)?;
        let input = self.input(input_index)?;

        let eval = self.arena.evaluate(root, coordinates.epoch, want_gradient)?;
        let sky = coordinates.sky.unwrap_or_else(Jones::identity);
        let jones = eval.jones * sky;
        let rho = input.stokes().to_coherency();
        let predicted = Stokes::from_coherency(jones * rho * jones.h());

        trace!(
            "evaluate path={path_index} input={input_index}: predicted {predicted:?}"
        );

        let gradient = match (want_gradient, eval.gradient) {
            (true, Some(path_gradient)) => {
                let mut gradient = vec![Stokes::default(); self.get_nparam()];

                // The selected input state's parameters: ∂ρ'/∂Sₖ = J σₖ/2 J†.
                for k in 0..4 {
                    let basis = Stokes::basis(k);
                    gradient[4 * input_index + k] =
                        Stokes::from_coherency(jones * basis * jones.h());
                }

                // The path's parameters: with D = (∂J_path/∂p)·J_sky,
                // ∂ρ'/∂p = D ρ J† + (D ρ J†)†.
                for (offset, partial) in path_gradient.into_iter().enumerate() {
                    if partial.to_float_array().iter().all(|&x| x == 0.0) {
                        continue;
                    }
                    let x = (partial * sky) * rho * jones.h();
                    gradient[self.input_params() + offset] = Stokes::from_coherency(x + x.h());
                }
                Some(gradient)
            }
            _ => None,
        };

        Ok((predicted, gradient))
    }

    /// Copy every fitted value (arena parameters and input states) from a
    /// structurally identical equation. Used by the recovery heuristic to
    /// reseed a poorly converged channel from a neighbor.
    pub fn copy_fit_from(&mut self, other: &MeasurementEquation) -> Result<(), EquationError> {
        if self.inputs.len() != other.inputs.len() {
            return Err(EquationError::InputCountMismatch {
                dest: self.inputs.len(),
                src: other.inputs.len(),
            });
        }
        self.arena.copy_params_from(&other.arena)?;
        for (input, src) in self.inputs.iter_mut().zip(&other.inputs) {
            for (param, src) in input.params.iter_mut().zip(&src.params) {
                param.value = src.value;
            }
        }
        Ok(())
    }
}
