// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Transformation-graph tests. The gradient of every kind, and of nested
//! compositions, is checked against central finite differences.

use approx::assert_abs_diff_eq;
use hifitime::Epoch;
use marlu::Jones;

use super::*;
use crate::coherency::Stokes;

fn epoch(gpst: f64) -> Epoch {
    Epoch::from_gpst_seconds(gpst)
}

/// Central finite-difference gradient of one parameter.
fn numeric_gradient(
    arena: &ModelArena,
    root: NodeId,
    at: Epoch,
    node: NodeId,
    iparam: usize,
) -> Jones<f64> {
    let h = 1e-6;
    let mut perturbed = arena.clone();
    let value = perturbed.get_param(node, iparam).unwrap();
    perturbed.set_param(node, iparam, value + h).unwrap();
    let plus = perturbed.evaluate(root, at, false).unwrap().jones;
    perturbed.set_param(node, iparam, value - h).unwrap();
    let minus = perturbed.evaluate(root, at, false).unwrap().jones;
    (plus - minus) * (0.5 / h)
}

/// Check every analytic gradient entry of `root` against finite
/// differences.
fn assert_gradient_matches(arena: &ModelArena, root: NodeId, at: Epoch) {
    let eval = arena.evaluate(root, at, true).unwrap();
    let gradient = eval.gradient.unwrap();
    assert_eq!(gradient.len(), arena.nparam_total());

    for id in 0..arena.num_nodes() {
        let id = NodeId(id);
        let offset = arena.param_offset(id).unwrap();
        for iparam in 0..arena.nparam(id).unwrap() {
            let numeric = numeric_gradient(arena, root, at, id, iparam);
            assert_abs_diff_eq!(gradient[offset + iparam], numeric, epsilon = 1e-6);
        }
    }
}

#[test]
fn leaf_gradients_match_finite_differences() {
    use strum::IntoEnumIterator;

    let at = epoch(0.0);

    let mut arena = ModelArena::new();
    let gain = arena.add_gain();
    arena.set_param(gain, 0, 1.3).unwrap();
    assert_gradient_matches(&arena, gain, at);

    let backend = arena.add_backend();
    arena.set_param(backend, 0, 1.2).unwrap();
    arena.set_param(backend, 1, 0.15).unwrap();
    arena.set_param(backend, 2, -0.4).unwrap();
    assert_gradient_matches(&arena, backend, at);

    for axis in StokesAxis::iter() {
        let rotation = arena.add_rotation(axis);
        arena.set_param(rotation, 0, 0.7).unwrap();
        assert_gradient_matches(&arena, rotation, at);

        let boost = arena.add_boost(axis);
        arena.set_param(boost, 0, -0.2).unwrap();
        assert_gradient_matches(&arena, boost, at);
    }
}

#[test]
fn backend_mueller_action() {
    let mut arena = ModelArena::new();
    let backend = arena.add_backend();
    let (g, gamma, phi) = (1.2, 0.05, 0.1);
    arena.set_param(backend, 0, g).unwrap();
    arena.set_param(backend, 1, gamma).unwrap();
    arena.set_param(backend, 2, phi).unwrap();

    let jones = arena.evaluate(backend, epoch(0.0), false).unwrap().jones;
    let s = Stokes([1.0, 0.3, -0.2, 0.1]);
    let out = Stokes::from_coherency(jones * s.to_coherency() * jones.h());

    let g2 = g * g;
    assert_abs_diff_eq!(
        out[0],
        g2 * (gamma.cosh() * s[0] + gamma.sinh() * s[1]),
        epsilon = 1e-12
    );
    assert_abs_diff_eq!(
        out[1],
        g2 * (gamma.sinh() * s[0] + gamma.cosh() * s[1]),
        epsilon = 1e-12
    );
    assert_abs_diff_eq!(
        out[2],
        g2 * (phi.cos() * s[2] - phi.sin() * s[3]),
        epsilon = 1e-12
    );
    assert_abs_diff_eq!(
        out[3],
        g2 * (phi.sin() * s[2] + phi.cos() * s[3]),
        epsilon = 1e-12
    );
}

#[test]
fn rotation_about_v_rotates_q_u() {
    let mut arena = ModelArena::new();
    let rotation = arena.add_rotation(StokesAxis::V);
    let theta = 0.35;
    arena.set_param(rotation, 0, theta).unwrap();

    let jones = arena.evaluate(rotation, epoch(0.0), false).unwrap().jones;
    let s = Stokes([1.0, 0.6, -0.1, 0.2]);
    let out = Stokes::from_coherency(jones * s.to_coherency() * jones.h());

    let (c, n) = ((2.0 * theta).cos(), (2.0 * theta).sin());
    assert_abs_diff_eq!(out[0], s[0], epsilon = 1e-12);
    assert_abs_diff_eq!(out[1], c * s[1] + n * s[2], epsilon = 1e-12);
    assert_abs_diff_eq!(out[2], -n * s[1] + c * s[2], epsilon = 1e-12);
    assert_abs_diff_eq!(out[3], s[3], epsilon = 1e-12);
}

#[test]
fn product_order_applies_last_member_first() {
    // A boost along Q followed by a rotation about V does not commute; the
    // product must apply its last member to the signal first.
    let mut arena = ModelArena::new();
    let rotation = arena.add_rotation(StokesAxis::V);
    let boost = arena.add_boost(StokesAxis::Q);
    arena.set_param(rotation, 0, 0.3).unwrap();
    arena.set_param(boost, 0, 0.2).unwrap();
    let product = arena.add_product(vec![rotation, boost]).unwrap();

    let at = epoch(0.0);
    let j_rotation = arena.evaluate(rotation, at, false).unwrap().jones;
    let j_boost = arena.evaluate(boost, at, false).unwrap().jones;
    let j_product = arena.evaluate(product, at, false).unwrap().jones;
    assert_abs_diff_eq!(j_product, j_rotation * j_boost, epsilon = 1e-12);
}

#[test]
fn nested_composition_gradients_match_finite_differences() {
    // Product(Bound(Segmented(backend)), rotation, boost) exercises every
    // composite kind at once.
    let mut arena = ModelArena::new();
    let backend = arena.add_backend();
    arena.set_param(backend, 0, 1.1).unwrap();
    arena.set_param(backend, 1, 0.08).unwrap();
    arena.set_param(backend, 2, 0.2).unwrap();
    let segmented = arena.add_segmented(backend).unwrap();
    assert!(arena.add_step(segmented, epoch(1000.0)).unwrap());

    let bound = arena.add_bound(segmented).unwrap();
    // Bind the first segment's differential phase (flattened index 2) to a
    // linear polynomial of time.
    arena
        .bind(bound, 2, TimePolynomial::new(epoch(0.0), 2))
        .unwrap();
    // c0 is seeded from the bound parameter; perturb the slope.
    assert_abs_diff_eq!(arena.get_param(bound, 0).unwrap(), 0.2);
    arena.set_param(bound, 1, 0.01).unwrap();

    let rotation = arena.add_rotation(StokesAxis::V);
    let boost = arena.add_boost(StokesAxis::U);
    arena.set_param(rotation, 0, -0.25).unwrap();
    arena.set_param(boost, 0, 0.15).unwrap();
    let path = arena.add_product(vec![bound, rotation, boost]).unwrap();

    // One epoch in each segment.
    assert_gradient_matches(&arena, path, epoch(500.0));
    assert_gradient_matches(&arena, path, epoch(2000.0));
}

#[test]
fn inactive_segment_gradient_is_zero() {
    let mut arena = ModelArena::new();
    let backend = arena.add_backend();
    let segmented = arena.add_segmented(backend).unwrap();
    arena.add_step(segmented, epoch(1000.0)).unwrap();

    let eval = arena.evaluate(segmented, epoch(500.0), true).unwrap();
    let gradient = eval.gradient.unwrap();
    // The second segment's backend is the last node added.
    let second = NodeId(arena.num_nodes() - 1);
    assert_eq!(arena.kind(second).unwrap(), TransformKind::DiffGainPhase);
    let offset = arena.param_offset(second).unwrap();
    for iparam in 0..3 {
        assert_abs_diff_eq!(gradient[offset + iparam], Jones::default(), epsilon = 0.0);
    }
    // The first segment's gradient is not zero.
    let offset = arena.param_offset(backend).unwrap();
    assert!(gradient[offset].to_float_array().iter().any(|&x| x != 0.0));
}

#[test]
fn segmentation_partitions_time() {
    let mut arena = ModelArena::new();
    let backend = arena.add_backend();
    arena.set_param(backend, 1, 0.05).unwrap();
    let segmented = arena.add_segmented(backend).unwrap();

    // Insert boundaries out of order; duplicates are no-ops.
    assert!(arena.add_step(segmented, epoch(2000.0)).unwrap());
    assert!(arena.add_step(segmented, epoch(1000.0)).unwrap());
    assert!(!arena.add_step(segmented, epoch(2000.0)).unwrap());
    assert_eq!(arena.num_segments(segmented).unwrap(), 3);

    // Every epoch maps to exactly one segment; boundaries belong to the
    // segment they start; out-of-range epochs clamp.
    assert_eq!(arena.segment_at(segmented, epoch(-1e6)).unwrap().0, 0);
    assert_eq!(arena.segment_at(segmented, epoch(999.0)).unwrap().0, 0);
    assert_eq!(arena.segment_at(segmented, epoch(1000.0)).unwrap().0, 1);
    assert_eq!(arena.segment_at(segmented, epoch(1999.0)).unwrap().0, 1);
    assert_eq!(arena.segment_at(segmented, epoch(2000.0)).unwrap().0, 2);
    assert_eq!(arena.segment_at(segmented, epoch(1e9)).unwrap().0, 2);

    // Segments are contiguous: each segment's end is the next's start.
    for i in 0..2 {
        let (_, end) = arena.segment_span(segmented, i).unwrap();
        let (start, _) = arena.segment_span(segmented, i + 1).unwrap();
        assert_eq!(end, start);
        assert!(end.is_some());
    }

    // New segments are seeded from the segment active before the insertion
    // point.
    let (_, seg2) = arena.segment_at(segmented, epoch(2500.0)).unwrap();
    assert_abs_diff_eq!(arena.get_param(seg2, 1).unwrap(), 0.05);
}

#[test]
fn binding_does_not_double_count_parameters() {
    let mut arena = ModelArena::new();
    let backend = arena.add_backend();
    let bound = arena.add_bound(backend).unwrap();
    assert_eq!(arena.nparam_total(), 3);

    let count_free = |arena: &ModelArena| -> usize {
        let mut n = 0;
        for id in 0..arena.num_nodes() {
            for iparam in 0..arena.nparam(NodeId(id)).unwrap() {
                if arena.get_infit(NodeId(id), iparam).unwrap() {
                    n += 1;
                }
            }
        }
        n
    };
    assert_eq!(count_free(&arena), 3);

    // Binding diff_gain (flattened index 1) to a quadratic removes one free
    // parameter and adds three coefficients.
    arena
        .bind(bound, 1, TimePolynomial::new(epoch(0.0), 3))
        .unwrap();
    assert_eq!(arena.nparam_total(), 6);
    assert_eq!(count_free(&arena), 5);
    assert!(!arena.get_infit(backend, 1).unwrap());

    // Re-binding is an error; unbinding restores the free flag and writes
    // the constant term back.
    assert!(matches!(
        arena.bind(bound, 1, TimePolynomial::new(epoch(0.0), 2)),
        Err(ModelError::AlreadyBound { .. })
    ));
    arena.set_param(bound, 0, 0.42).unwrap();
    arena.unbind(bound, 1).unwrap();
    assert_eq!(arena.nparam_total(), 3);
    assert_eq!(count_free(&arena), 3);
    assert_abs_diff_eq!(arena.get_param(backend, 1).unwrap(), 0.42);
    assert!(matches!(
        arena.unbind(bound, 1),
        Err(ModelError::NotBound { .. })
    ));
}

#[test]
fn bound_parameter_follows_the_polynomial() {
    let mut arena = ModelArena::new();
    let gain = arena.add_gain();
    let bound = arena.add_bound(gain).unwrap();
    arena
        .bind(bound, 0, TimePolynomial::new(epoch(0.0), 2))
        .unwrap();
    arena.set_param(bound, 0, 1.0).unwrap();
    // One day is 86400 s; slope of 0.1 per day.
    arena.set_param(bound, 1, 0.1).unwrap();

    let jones = arena.evaluate(bound, epoch(86400.0), false).unwrap().jones;
    assert_abs_diff_eq!(jones, Jones::identity() * 1.1, epsilon = 1e-12);
}

#[test]
fn unknown_nodes_are_rejected() {
    let mut arena = ModelArena::new();
    let gain = arena.add_gain();
    assert!(matches!(
        arena.add_product(vec![gain, NodeId(99)]),
        Err(ModelError::UnknownNode { .. })
    ));
    assert!(matches!(
        arena.get_param(NodeId(99), 0),
        Err(ModelError::UnknownNode { .. })
    ));
    assert!(matches!(
        arena.get_param(gain, 1),
        Err(ModelError::InvalidParamIndex { .. })
    ));
    assert!(matches!(
        arena.add_step(gain, epoch(0.0)),
        Err(ModelError::WrongKind { .. })
    ));
}

#[test]
fn arena_serde_round_trip() {
    let mut arena = ModelArena::new();
    let backend = arena.add_backend();
    arena.set_param(backend, 1, 0.07).unwrap();
    arena.set_infit(backend, 0, false).unwrap();
    let segmented = arena.add_segmented(backend).unwrap();
    arena.add_step(segmented, epoch(1000.0)).unwrap();
    let bound = arena.add_bound(segmented).unwrap();
    arena
        .bind(bound, 2, TimePolynomial::new(epoch(0.0), 2))
        .unwrap();
    let rotation = arena.add_rotation(StokesAxis::V);
    let path = arena.add_product(vec![bound, rotation]).unwrap();

    let json = serde_json::to_string(&arena).unwrap();
    let restored: ModelArena = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.num_nodes(), arena.num_nodes());
    assert_eq!(restored.nparam_total(), arena.nparam_total());
    assert_eq!(restored.get_infit(backend, 0).unwrap(), false);
    assert_abs_diff_eq!(restored.get_param(backend, 1).unwrap(), 0.07);

    // The restored graph evaluates identically.
    let at = epoch(500.0);
    assert_abs_diff_eq!(
        restored.evaluate(path, at, false).unwrap().jones,
        arena.evaluate(path, at, false).unwrap().jones,
        epsilon = 1e-15
    );
}

#[test]
fn copy_params_from_matches_structure() {
    let mut a = ModelArena::new();
    let backend = a.add_backend();
    let mut b = a.clone();
    b.set_param(backend, 0, 1.5).unwrap();
    b.set_param(backend, 2, 0.3).unwrap();

    a.copy_params_from(&b).unwrap();
    assert_abs_diff_eq!(a.get_param(backend, 0).unwrap(), 1.5);
    assert_abs_diff_eq!(a.get_param(backend, 2).unwrap(), 0.3);

    let mut c = ModelArena::new();
    c.add_gain();
    assert!(matches!(
        a.copy_params_from(&c),
        Err(ModelError::StructureMismatch { .. })
    ));
}
