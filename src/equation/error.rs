// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for measurement-equation errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EquationError {
    #[error("Signal path index {index} is out of range; the equation has {num_paths} paths")]
    PathIndex { index: usize, num_paths: usize },

    #[error("Input state index {index} is out of range; the equation has {num_inputs} input states")]
    InputIndex { index: usize, num_inputs: usize },

    #[error(
        "Measurement for input {input_index} has negative variance {variance:e} in Stokes component {component}"
    )]
    NegativeVariance {
        input_index: usize,
        component: usize,
        variance: f64,
    },

    #[error("Cannot add {what} after solving has begun")]
    SolvingStarted { what: &'static str },

    #[error("Measurement set index {index} is out of range; the equation has {ndata} sets")]
    DataIndex { index: usize, ndata: usize },

    #[error("Global parameter index {index} is out of range; the equation has {nparam} parameters")]
    ParamIndex { index: usize, nparam: usize },

    #[error("Cannot copy fit values: this equation has {dest} input states, the source has {src}")]
    InputCountMismatch { dest: usize, src: usize },

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),
}
