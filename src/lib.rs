// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Measurement-equation engine for polarimetric calibration of radio telescopes.

This crate fits a parametric model of a receiving system (the "measurement
equation") to collections of polarization measurements, simultaneously
estimating instrumental parameters (gain, differential gain and phase,
receptor geometry, optionally time-varying) and the polarization states of
unknown input sources, per frequency channel, by weighted nonlinear least
squares.

The core pieces are:

- [`model`]: a composable graph of parametric Jones transformations with
  analytic gradients;
- [`coherency`]: polarization measurements and the coordinate context they
  share;
- [`paths`]: the signal-path manager, which builds the chains experienced
  by each class of observation and manages backend time segmentation;
- [`estimate`]: running-mean estimators that seed initial parameter
  guesses;
- [`equation`]: the per-channel aggregator that indexes measurements
  against paths and input states;
- [`solver`]: the Levenberg-Marquardt engine and covariance extraction;
- [`scheduler`]: bounded-concurrency solving of independent channels with
  a one-shot recovery heuristic.

Archive I/O, measurement extraction and presentation layers live in the
surrounding applications; this crate is the in-process fitting engine.
 */

pub mod coherency;
pub mod equation;
mod error;
pub mod estimate;
pub(crate) mod math;
pub mod model;
pub mod paths;
pub mod scheduler;
pub mod solver;

// Re-exports.
pub use coherency::{CoherencyMeasurement, CoherencyMeasurementSet, Coordinates, Stokes};
pub use equation::MeasurementEquation;
pub use error::PolcalError;
pub use estimate::{BackendEstimate, SourceEstimate};
pub use model::{ModelArena, NodeId, StokesAxis, TimePolynomial, TransformKind};
pub use paths::{ObsClass, SignalPathConfig, SignalPathManager};
pub use scheduler::{Channel, ChannelScheduler};
pub use solver::{solve, FailureClass, SolveOptions, SolveResult, SolveStatus};

use crossbeam_utils::atomic::AtomicCell;

/// Whether progress bars are drawn while channels are being solved.
pub static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
