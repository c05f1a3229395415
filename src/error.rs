// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all polcal-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolcalError {
    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error(transparent)]
    Equation(#[from] crate::equation::EquationError),

    #[error(transparent)]
    Path(#[from] crate::paths::PathError),

    #[error(transparent)]
    Estimate(#[from] crate::estimate::EstimateError),

    #[error(transparent)]
    Solve(#[from] crate::solver::SolveError),

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}
