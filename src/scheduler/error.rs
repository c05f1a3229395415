// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for channel-scheduler errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to build the worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
