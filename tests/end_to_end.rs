// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An end-to-end run of the fitting engine: the signal-path manager builds
//! a segmented standard model per channel, estimators seed the initial
//! guesses, the scheduler solves the channels in parallel, and the fitted
//! transformations, recovered input states and covariances come back out.

use approx::assert_abs_diff_eq;
use hifitime::Epoch;
use marlu::{c64, Jones};

use polcal::{
    Channel, ChannelScheduler, CoherencyMeasurement, CoherencyMeasurementSet, Coordinates,
    ModelArena, ObsClass, SignalPathConfig, SignalPathManager, SolveOptions, SolveStatus, Stokes,
};

fn epoch(gpst: f64) -> Epoch {
    Epoch::from_gpst_seconds(gpst)
}

fn sky_rotation(theta: f64) -> Jones<f64> {
    Jones::from([
        c64::new(theta.cos(), 0.0),
        c64::new(theta.sin(), 0.0),
        c64::new(-theta.sin(), 0.0),
        c64::new(theta.cos(), 0.0),
    ])
}

const STEP_EPOCH: f64 = 300.0;
/// (gain, differential gain, differential phase) per backend segment, and
/// an epoch inside each segment.
const SEGMENTS: [(f64, [f64; 3]); 2] = [(0.0, [1.2, 0.05, 0.1]), (1000.0, [1.3, 0.02, -0.2])];
const TARGET_TRUTH: Stokes = Stokes([1.0, 0.2, -0.1, 0.05]);

/// Build one channel: a two-segment backend with a fixed frontend, a
/// reference calibrator of known state, and exact synthetic observations
/// of both classes. `poison` offsets half the target measurements to make
/// the channel's data internally inconsistent.
fn build_channel(index: usize, poison: f64) -> Channel {
    let mut manager = SignalPathManager::new(&SignalPathConfig::default()).unwrap();
    manager.add_refcal_path().unwrap();
    manager.add_step(epoch(STEP_EPOCH)).unwrap();
    // The receptor geometry is known for this receiver.
    manager.fit_orientation(false).unwrap();
    manager.fit_ellipticity(false).unwrap();

    let target = manager.add_target_states(1).unwrap()[0];
    let refcal = manager.add_refcal_state().unwrap();
    manager
        .equation_mut()
        .set_input_infit(refcal, false)
        .unwrap();

    // Give each segment its true parameters and the target its true state,
    // and generate exact observations of both classes.
    for (probe, truth) in SEGMENTS {
        let (_, segment) = manager.get_segment(epoch(probe)).unwrap();
        let arena = manager.equation_mut().arena_mut();
        for (iparam, value) in truth.into_iter().enumerate() {
            arena.set_param(segment, iparam, value).unwrap();
        }
    }
    for k in 0..4 {
        let i = manager.equation().input_param_index(target, k).unwrap();
        manager.equation_mut().set_param(i, TARGET_TRUTH[k]).unwrap();
    }

    let target_path = manager.path_index(ObsClass::Target).unwrap();
    let refcal_path = manager.path_index(ObsClass::ReferenceCalibrator).unwrap();

    let mut sets = vec![];
    // Reference calibrator observations in both segments.
    for gpst in [0.0, 100.0, 200.0, 400.0, 500.0, 600.0] {
        let coordinates = Coordinates::new(epoch(gpst));
        let (predicted, _) = manager
            .equation()
            .evaluate(refcal_path, refcal, &coordinates, false)
            .unwrap();
        sets.push(CoherencyMeasurementSet::new(
            refcal_path,
            coordinates,
            vec![CoherencyMeasurement {
                input_index: refcal,
                stokes: predicted,
                variance: [1.0; 4],
            }],
        ));
    }
    // Target observations across the parallactic swing, in both segments.
    for (i, gpst) in [50.0, 150.0, 250.0, 350.0, 450.0, 550.0]
        .into_iter()
        .enumerate()
    {
        let coordinates = Coordinates::with_sky(epoch(gpst), sky_rotation(0.3 * i as f64));
        let (predicted, _) = manager
            .equation()
            .evaluate(target_path, target, &coordinates, false)
            .unwrap();
        let offset = if i % 2 == 0 { poison } else { -poison };
        sets.push(CoherencyMeasurementSet::new(
            target_path,
            coordinates,
            vec![CoherencyMeasurement {
                input_index: target,
                stokes: predicted + Stokes([0.0, 0.0, offset, 0.0]),
                variance: [1.0; 4],
            }],
        ));
    }

    // The true values were only used to generate data: reset the target
    // state to unpolarized and the segments to defaults, then seed the
    // segments through the estimators, as the application would from
    // per-observation calibrator solutions.
    for k in 0..4 {
        let i = manager.equation().input_param_index(target, k).unwrap();
        let seed = if k == 0 { 1.0 } else { 0.0 };
        manager.equation_mut().set_param(i, seed).unwrap();
    }
    for (integrate_at, (probe, truth)) in [100.0, 400.0].into_iter().zip(SEGMENTS) {
        let (_, segment) = manager.get_segment(epoch(probe)).unwrap();
        let arena = manager.equation_mut().arena_mut();
        for iparam in 0..3 {
            let default = if iparam == 0 { 1.0 } else { 0.0 };
            arena.set_param(segment, iparam, default).unwrap();
        }

        // The observed solution is close to, but not exactly, the truth,
        // as a real single-epoch fit would be.
        let mut observed = ModelArena::new();
        let solution = observed.add_backend();
        for (iparam, value) in truth.into_iter().enumerate() {
            observed.set_param(solution, iparam, value + 0.02).unwrap();
            observed.set_variance(solution, iparam, 0.01).unwrap();
        }
        manager
            .integrate_calibrator(epoch(integrate_at), &observed, solution)
            .unwrap();
    }
    let unconstrained = manager.update().unwrap();
    assert!(unconstrained.is_empty());

    let mut equation = manager.into_equation();
    for set in sets {
        equation.add_data(set).unwrap();
    }
    Channel::new(index, equation)
}

#[test]
fn full_pipeline_recovers_the_instrument_and_the_target() {
    let mut scheduler = ChannelScheduler::new(2, SolveOptions::default()).unwrap();
    scheduler.set_retry_threshold(Some(0.01));

    scheduler.submit(build_channel(0, 0.0));
    scheduler.submit(build_channel(1, 1.0));
    scheduler.submit(build_channel(2, 0.0));

    let channels = scheduler.wait_all();
    assert_eq!(channels.len(), 3);

    for channel in [&channels[0], &channels[2]] {
        assert!(channel.is_valid(), "channel {} invalid", channel.index);
        assert_eq!(channel.status(), SolveStatus::Converged);

        let equation = &channel.equation;
        let result = channel.result().unwrap();
        assert!(result.reduced_chisq < 1e-4);
        // 2 segments x 3 backend parameters + 4 target Stokes parameters.
        assert_eq!(result.nfit, 10);
        assert_eq!(result.covariance.nrows(), equation.get_nparam());

        // The recovered target polarization, with uncertainties.
        let target_state = equation.input(0).unwrap();
        let recovered = target_state.stokes();
        for k in 0..4 {
            assert_abs_diff_eq!(recovered[k], TARGET_TRUTH[k], epsilon = 1e-3);
            assert!(target_state.variances()[k] > 0.0);
        }
    }

    // The poisoned channel converged, was retried once off a neighbor,
    // and stays flagged invalid without stopping the run.
    let bad = &channels[1];
    assert_eq!(bad.status(), SolveStatus::Converged);
    assert!(bad.was_retried());
    assert!(!bad.is_valid());
    assert!(bad.failure().is_some());
}
