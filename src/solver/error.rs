// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for solver errors.

use thiserror::Error;

use crate::math::MathError;

/// How a [SolveError](crate::solver::SolveError) should be handled.
///
/// Structural errors indicate a programming error in the caller and always
/// escalate; numerical and convergence failures are recorded per channel by
/// the scheduler and must never abort sibling channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// A malformed model or data set (InvalidParam/InvalidState).
    Structural,
    /// Singular normal equations or a non-finite/negative variance.
    Numerical,
    /// The iteration cap or the reduced chi-squared ceiling was hit.
    Convergence,
}

#[derive(Error, Debug)]
pub enum SolveError {
    #[error("The measurement equation has no data")]
    NoData,

    #[error("No parameters are free in the fit")]
    NoFreeParameters,

    #[error(
        "Insufficient constraints: {nconstraint} scalar constraints for {nfit} free parameters"
    )]
    InsufficientConstraints { nconstraint: usize, nfit: usize },

    #[error("Signal path {path} has free parameters but no measurements reference it")]
    UnconstrainedPath { path: usize },

    #[error("Input state {input} has free parameters but no measurements reference it")]
    UnconstrainedInput { input: usize },

    #[error("The normal equations are singular at iteration {iteration}: {source}")]
    Singular {
        iteration: u32,
        #[source]
        source: MathError,
    },

    #[error("Failed to converge after {iterations} iterations")]
    ConvergenceFailure { iterations: u32 },

    #[error("Non-finite variance for parameter {name}")]
    NonFiniteVariance { name: String },

    #[error("Negative variance {variance:e} for parameter {name}")]
    NegativeVariance { name: String, variance: f64 },

    #[error("Bad reduced chi-squared {reduced_chisq} with {nfree} degrees of freedom")]
    BadReducedChisq { reduced_chisq: f64, nfree: u32 },

    #[error(transparent)]
    Equation(#[from] crate::equation::EquationError),
}

impl SolveError {
    pub fn class(&self) -> FailureClass {
        match self {
            SolveError::NoData
            | SolveError::NoFreeParameters
            | SolveError::InsufficientConstraints { .. }
            | SolveError::UnconstrainedPath { .. }
            | SolveError::UnconstrainedInput { .. }
            | SolveError::Equation(_) => FailureClass::Structural,

            SolveError::Singular { .. }
            | SolveError::NonFiniteVariance { .. }
            | SolveError::NegativeVariance { .. } => FailureClass::Numerical,

            SolveError::ConvergenceFailure { .. } | SolveError::BadReducedChisq { .. } => {
                FailureClass::Convergence
            }
        }
    }
}
