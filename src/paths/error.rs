// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for signal-path manager errors.

use hifitime::Epoch;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("The signal-path model has no {what} path")]
    MissingPath { what: &'static str },

    #[error("No backend estimate spans epoch {epoch}")]
    NoSpanningEstimate { epoch: Epoch },

    #[error("Backend segment index {segment} is out of range ({nsegments} segments)")]
    SegmentIndex { segment: usize, nsegments: usize },

    #[error("Backend parameter index {iparam} is out of range (the backend has {nparam})")]
    BackendParamIndex { iparam: usize, nparam: usize },

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error(transparent)]
    Equation(#[from] crate::equation::EquationError),

    #[error(transparent)]
    Estimate(#[from] crate::estimate::EstimateError),
}
