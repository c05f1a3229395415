// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for estimator errors.

use thiserror::Error;

use crate::model::TransformKind;

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error(
        "No successful integrations: the estimate is unconstrained ({attempts} attempts, {failures} failures)"
    )]
    Unconstrained { attempts: u32, failures: u32 },

    #[error("Cannot accumulate a {found} transformation into a {expected} estimate")]
    KindMismatch {
        expected: TransformKind,
        found: TransformKind,
    },

    #[error("{kind} is not an elementary transformation kind")]
    NotElementary { kind: TransformKind },

    #[error("Non-finite value {value} for parameter {iparam}")]
    NonFinite { iparam: usize, value: f64 },

    #[error("Parameter count mismatch: {got} values for a {kind} estimate with {expected} parameters")]
    ParamCount {
        kind: TransformKind,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error(transparent)]
    Equation(#[from] crate::equation::EquationError),
}
