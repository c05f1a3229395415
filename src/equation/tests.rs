// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Measurement-equation tests, including finite-difference checks of the
//! gradient through the full prediction (input state, fitted path and
//! known sky rotation together).

use approx::assert_abs_diff_eq;
use hifitime::Epoch;
use marlu::Jones;

use super::*;
use crate::coherency::CoherencyMeasurement;
use crate::model::StokesAxis;

fn epoch(gpst: f64) -> Epoch {
    Epoch::from_gpst_seconds(gpst)
}

/// A one-path, one-input equation: instrument = backend × rotation.
fn simple_equation() -> MeasurementEquation {
    let mut equation = MeasurementEquation::new();
    let arena = equation.arena_mut();
    let backend = arena.add_backend();
    arena.set_param(backend, 0, 1.2).unwrap();
    arena.set_param(backend, 1, 0.05).unwrap();
    arena.set_param(backend, 2, 0.1).unwrap();
    let rotation = arena.add_rotation(StokesAxis::V);
    arena.set_param(rotation, 0, 0.2).unwrap();
    let path = arena.add_product(vec![backend, rotation]).unwrap();
    equation.add_transformation(path).unwrap();
    equation
        .add_input(Stokes([1.0, 0.3, -0.1, 0.05]))
        .unwrap();
    equation
}

fn measurement(input_index: usize) -> CoherencyMeasurement {
    CoherencyMeasurement {
        input_index,
        stokes: Stokes([1.0, 0.0, 0.0, 0.0]),
        variance: [1.0; 4],
    }
}

#[test]
fn add_data_fails_fast_on_bad_indices() {
    let mut equation = simple_equation();

    // A path index out of range.
    let set = CoherencyMeasurementSet::new(1, Coordinates::new(epoch(0.0)), vec![measurement(0)]);
    assert!(matches!(
        equation.add_data(set),
        Err(EquationError::PathIndex {
            index: 1,
            num_paths: 1
        })
    ));

    // An input index out of range.
    let set = CoherencyMeasurementSet::new(0, Coordinates::new(epoch(0.0)), vec![measurement(7)]);
    assert!(matches!(
        equation.add_data(set),
        Err(EquationError::InputIndex {
            index: 7,
            num_inputs: 1
        })
    ));

    // A negative variance.
    let mut bad = measurement(0);
    bad.variance[2] = -1.0;
    let set = CoherencyMeasurementSet::new(0, Coordinates::new(epoch(0.0)), vec![bad]);
    assert!(matches!(
        equation.add_data(set),
        Err(EquationError::NegativeVariance { component: 2, .. })
    ));

    // Nothing was appended.
    assert_eq!(equation.get_ndata(), 0);

    let set = CoherencyMeasurementSet::new(0, Coordinates::new(epoch(0.0)), vec![measurement(0)]);
    equation.add_data(set).unwrap();
    assert_eq!(equation.get_ndata(), 1);
}

#[test]
fn structural_additions_are_refused_after_solving_begins() {
    let mut equation = simple_equation();
    equation.begin_solve();

    let gain = equation.arena_mut().add_gain();
    assert!(matches!(
        equation.add_transformation(gain),
        Err(EquationError::SolvingStarted { .. })
    ));
    assert!(matches!(
        equation.add_input(Stokes([1.0, 0.0, 0.0, 0.0])),
        Err(EquationError::SolvingStarted { .. })
    ));

    // delete_data reopens the equation for reuse.
    equation.delete_data();
    assert!(equation.add_transformation(gain).is_ok());
}

#[test]
fn global_parameter_layout() {
    let mut equation = simple_equation();
    // 4 input params + backend (3) + rotation (1).
    assert_eq!(equation.get_nparam(), 8);

    assert_eq!(equation.param_name(0).unwrap(), "input0.I");
    assert_eq!(equation.param_name(3).unwrap(), "input0.V");
    assert!(equation.param_name(4).unwrap().contains("gain"));
    assert!(equation.param_name(7).unwrap().contains("rotation"));

    // Input parameters read and write through the flat index.
    equation.set_param(1, 0.25).unwrap();
    assert_abs_diff_eq!(equation.get_param(1).unwrap(), 0.25);
    assert_abs_diff_eq!(equation.input(0).unwrap().stokes()[1], 0.25);

    equation.set_infit(3, false).unwrap();
    assert!(!equation.get_infit(3).unwrap());

    assert!(matches!(
        equation.get_param(8),
        Err(EquationError::ParamIndex { .. })
    ));
}

#[test]
fn prediction_matches_direct_jones_congruence() {
    let equation = simple_equation();
    let sky = {
        // A parallactic rotation of 0.4 radians.
        let mut arena = crate::model::ModelArena::new();
        let rotation = arena.add_rotation(StokesAxis::V);
        arena.set_param(rotation, 0, 0.4).unwrap();
        arena.evaluate(rotation, epoch(0.0), false).unwrap().jones
    };
    let coordinates = Coordinates::with_sky(epoch(0.0), sky);

    let (predicted, _) = equation.evaluate(0, 0, &coordinates, false).unwrap();

    let path = equation.path(0).unwrap();
    let j_path = equation
        .arena()
        .evaluate(path, epoch(0.0), false)
        .unwrap()
        .jones;
    let j = j_path * sky;
    let rho = equation.input(0).unwrap().stokes().to_coherency();
    let expected = Stokes::from_coherency(j * rho * j.h());
    for k in 0..4 {
        assert_abs_diff_eq!(predicted[k], expected[k], epsilon = 1e-12);
    }
}

#[test]
fn equation_gradient_matches_finite_differences() {
    let equation = simple_equation();
    let sky = Jones::identity() * 0.9;
    let coordinates = Coordinates::with_sky(epoch(0.0), sky);

    let (_, gradient) = equation.evaluate(0, 0, &coordinates, true).unwrap();
    let gradient = gradient.unwrap();
    assert_eq!(gradient.len(), equation.get_nparam());

    let h = 1e-6;
    for index in 0..equation.get_nparam() {
        let mut perturbed = equation.clone();
        let value = perturbed.get_param(index).unwrap();
        perturbed.set_param(index, value + h).unwrap();
        let (plus, _) = perturbed.evaluate(0, 0, &coordinates, false).unwrap();
        perturbed.set_param(index, value - h).unwrap();
        let (minus, _) = perturbed.evaluate(0, 0, &coordinates, false).unwrap();
        for k in 0..4 {
            let numeric = (plus[k] - minus[k]) * (0.5 / h);
            assert_abs_diff_eq!(gradient[index][k], numeric, epsilon = 1e-6);
        }
    }
}

#[test]
fn gradient_is_sparse_across_paths_and_inputs() {
    // Two paths with disjoint transformations, two inputs: evaluating one
    // combination leaves the other's parameters at zero gradient.
    let mut equation = MeasurementEquation::new();
    let arena = equation.arena_mut();
    let backend_a = arena.add_backend();
    let backend_b = arena.add_backend();
    equation.add_transformation(backend_a).unwrap();
    equation.add_transformation(backend_b).unwrap();
    equation.add_input(Stokes([1.0, 0.0, 0.0, 0.0])).unwrap();
    equation.add_input(Stokes([1.0, 0.1, 0.0, 0.0])).unwrap();

    let coordinates = Coordinates::new(epoch(0.0));
    let (_, gradient) = equation.evaluate(0, 1, &coordinates, true).unwrap();
    let gradient = gradient.unwrap();

    // Input 0's parameters are untouched.
    for index in 0..4 {
        assert_eq!(gradient[index], Stokes::default());
    }
    // Input 1's intensity certainly matters.
    assert!(gradient[4] != Stokes::default());
    // Path 0's backend has gradient, path 1's does not.
    let a0 = equation.node_param_index(backend_a, 0).unwrap();
    let b0 = equation.node_param_index(backend_b, 0).unwrap();
    assert!(gradient[a0] != Stokes::default());
    for iparam in 0..3 {
        let index = equation.node_param_index(backend_b, iparam).unwrap();
        assert_eq!(gradient[index], Stokes::default());
    }
}

#[test]
fn copy_fit_from_copies_values() {
    let mut a = simple_equation();
    let mut b = simple_equation();
    for index in 0..b.get_nparam() {
        b.set_param(index, 0.01 * index as f64 + 0.5).unwrap();
    }
    a.copy_fit_from(&b).unwrap();
    for index in 0..a.get_nparam() {
        assert_abs_diff_eq!(
            a.get_param(index).unwrap(),
            b.get_param(index).unwrap()
        );
    }

    let mut c = MeasurementEquation::new();
    c.add_input(Stokes([1.0, 0.0, 0.0, 0.0])).unwrap();
    c.add_input(Stokes([1.0, 0.0, 0.0, 0.0])).unwrap();
    assert!(matches!(
        a.copy_fit_from(&c),
        Err(EquationError::InputCountMismatch { .. })
    ));
}
