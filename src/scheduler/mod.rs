// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bounded-concurrency solving of independent frequency channels.
//!
//! Each [Channel] owns an independent copy of the full model, so channels
//! share no mutable state while fitting; the scheduler runs submitted
//! channels on a caller-owned worker pool and joins them at
//! [wait_all](ChannelScheduler::wait_all), the only blocking operation.
//!
//! A per-channel numerical or convergence failure is recorded as a
//! validity flag and reason; it never aborts sibling channels. After the
//! first wave of solves has fully drained, a sequential recovery pass
//! reseeds each poorly converged channel from the nearest channel with an
//! acceptable reduced chi-squared and re-solves it exactly once.

mod error;

pub use error::SchedulerError;

use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::equation::MeasurementEquation;
use crate::solver::{solve, FailureClass, SolveOptions, SolveResult, SolveStatus};
use crate::PROGRESS_BARS;

/// One frequency channel: an independent measurement equation plus the
/// state and outcome of its fit.
#[derive(Clone, Debug)]
pub struct Channel {
    /// The frequency-channel index, used for donor distance in recovery.
    pub index: usize,

    pub equation: MeasurementEquation,

    status: SolveStatus,
    result: Option<SolveResult>,
    failure: Option<(FailureClass, String)>,
    retried: bool,
    valid: bool,
}

impl Channel {
    pub fn new(index: usize, equation: MeasurementEquation) -> Channel {
        Channel {
            index,
            equation,
            status: SolveStatus::Unsolved,
            result: None,
            failure: None,
            retried: false,
            valid: false,
        }
    }

    pub fn status(&self) -> SolveStatus {
        self.status
    }

    /// The fit result, present once the channel has converged.
    pub fn result(&self) -> Option<&SolveResult> {
        self.result.as_ref()
    }

    pub fn reduced_chisq(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.reduced_chisq)
    }

    /// False if the fit failed, or converged above the retry threshold.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Why the channel is invalid, with the failure classification.
    pub fn failure(&self) -> Option<(FailureClass, &str)> {
        self.failure
            .as_ref()
            .map(|(class, reason)| (*class, reason.as_str()))
    }

    /// True if the recovery heuristic re-solved this channel.
    pub fn was_retried(&self) -> bool {
        self.retried
    }

    /// Run the fit, recording the outcome. Failures of any class are
    /// captured here so that one unsolvable channel never aborts its
    /// siblings; structural failures are additionally logged loudly, since
    /// they indicate a caller error.
    pub(crate) fn run(&mut self, options: &SolveOptions) {
        self.status = SolveStatus::Fitting;
        match solve(&mut self.equation, options) {
            Ok(result) => {
                self.status = SolveStatus::Converged;
                self.valid = true;
                self.failure = None;
                self.result = Some(result);
            }
            Err(error) => {
                self.status = SolveStatus::Failed;
                self.valid = false;
                self.result = None;
                if error.class() == FailureClass::Structural {
                    warn!("channel {}: structural failure: {error}", self.index);
                }
                self.failure = Some((error.class(), error.to_string()));
            }
        }
    }
}

/// Runs channels on a worker pool. See the [module docs](self).
pub struct ChannelScheduler {
    pool: ThreadPool,
    options: SolveOptions,

    /// If set, a converged channel whose reduced chi-squared exceeds this
    /// is re-seeded from its nearest acceptable neighbor and re-solved
    /// once.
    retry_threshold: Option<f64>,

    channels: Vec<Channel>,
}

impl ChannelScheduler {
    pub fn new(worker_count: usize, options: SolveOptions) -> Result<ChannelScheduler, SchedulerError> {
        let pool = ThreadPoolBuilder::new().num_threads(worker_count).build()?;
        Ok(ChannelScheduler {
            pool,
            options,
            retry_threshold: None,
            channels: vec![],
        })
    }

    /// Replace the worker pool with one of `worker_count` threads.
    pub fn set_worker_count(&mut self, worker_count: usize) -> Result<(), SchedulerError> {
        self.pool = ThreadPoolBuilder::new().num_threads(worker_count).build()?;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn set_retry_threshold(&mut self, threshold: Option<f64>) {
        self.retry_threshold = threshold;
    }

    /// Queue a channel for solving.
    pub fn submit(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    pub fn num_submitted(&self) -> usize {
        self.channels.len()
    }

    /// Solve every submitted channel, run the recovery pass, and return
    /// the channels with their results. Blocks until all work is done.
    pub fn wait_all(&mut self) -> Vec<Channel> {
        let mut channels = std::mem::take(&mut self.channels);
        let num_channels = channels.len();
        let progress = make_progress_bar(num_channels);
        let (tx, rx) = unbounded();

        self.pool.scope(|scope| {
            for channel in channels.iter_mut() {
                let tx = tx.clone();
                let progress = progress.clone();
                let options = &self.options;
                scope.spawn(move |_| {
                    channel.run(options);
                    progress.inc(1);
                    let _ = tx.send((channel.index, channel.status(), channel.reduced_chisq()));
                });
            }
        });
        progress.abandon();
        drop(tx);
        for (index, status, reduced) in rx.iter() {
            match (status, reduced) {
                (SolveStatus::Converged, Some(reduced)) => {
                    debug!("channel {index}: converged, reduced chisq {reduced:.5e}")
                }
                _ => debug!("channel {index}: failed"),
            }
        }

        let converged = channels
            .iter()
            .filter(|c| c.status() == SolveStatus::Converged)
            .count();
        info!(
            "{converged}/{num_channels} ({}%) channels converged",
            ((converged as f64 / num_channels.max(1) as f64) * 100.0).round()
        );

        self.recover(&mut channels);

        // A converged channel left above the retry threshold is flagged
        // invalid, but its result is kept for diagnostics.
        if let Some(threshold) = self.retry_threshold {
            for channel in channels.iter_mut() {
                if channel.status() == SolveStatus::Converged
                    && channel.reduced_chisq().is_some_and(|r| r > threshold)
                {
                    channel.valid = false;
                    channel.failure = Some((
                        FailureClass::Convergence,
                        format!(
                            "reduced chi-squared {:.5e} exceeds the retry threshold {threshold:e}",
                            channel.reduced_chisq().unwrap_or(f64::NAN),
                        ),
                    ));
                }
            }
        }

        let invalid = channels.iter().filter(|c| !c.is_valid()).collect::<Vec<_>>();
        if !invalid.is_empty() {
            info!(
                "{} invalid channel(s): {}",
                invalid.len(),
                invalid.iter().map(|c| c.index).join(", ")
            );
        }

        channels
    }

    /// The sequential recovery pass: every donor is a genuinely finished
    /// result, never a partially solved one.
    fn recover(&self, channels: &mut [Channel]) {
        let Some(threshold) = self.retry_threshold else {
            return;
        };
        for i in 0..channels.len() {
            let needs_retry = channels[i].status() == SolveStatus::Converged
                && !channels[i].retried
                && channels[i].reduced_chisq().is_some_and(|r| r > threshold);
            if !needs_retry {
                continue;
            }

            let Some(donor) = find_donor(channels, i, threshold) else {
                warn!(
                    "channel {}: reduced chisq {:.5e} is above the retry threshold and no channel can donate a seed",
                    channels[i].index,
                    channels[i].reduced_chisq().unwrap_or(f64::NAN),
                );
                continue;
            };

            debug!(
                "channel {}: re-solving, seeded from channel {}",
                channels[i].index, channels[donor].index
            );
            // A read-only copy out of a finished channel.
            let seed = channels[donor].equation.clone();
            channels[i].retried = true;
            if let Err(error) = channels[i].equation.copy_fit_from(&seed) {
                warn!(
                    "channel {}: cannot copy the donor's parameters: {error}",
                    channels[i].index
                );
                continue;
            }
            channels[i].run(&self.options);
        }
    }
}

/// Search outward from `i`, alternating directions with the nearest
/// channels first (lower index first at equal distance), for a channel
/// whose own reduced chi-squared is acceptable.
fn find_donor(channels: &[Channel], i: usize, threshold: f64) -> Option<usize> {
    for distance in 1..channels.len() {
        let below = i.checked_sub(distance);
        let above = (i + distance < channels.len()).then_some(i + distance);
        for candidate in [below, above].into_iter().flatten() {
            if channels[candidate].status() == SolveStatus::Converged
                && channels[candidate]
                    .reduced_chisq()
                    .is_some_and(|r| r <= threshold)
            {
                return Some(candidate);
            }
        }
    }
    None
}

/// Convenience function to make a progress bar while solving channels.
fn make_progress_bar(num_channels: usize) -> ProgressBar {
    ProgressBar::with_draw_target(
        Some(num_channels as _),
        if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg}: [{wide_bar:.blue}] {pos:3}/{len:3} ({elapsed_precise}<{eta_precise})")
            .unwrap()
            .progress_chars("=> "),
    )
    .with_position(0)
    .with_message("Solving channels")
}
