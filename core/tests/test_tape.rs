//! Tape integration: the correlation primitive registered as an opaque VJP
//! composes with ordinary tape ops.

use std::collections::HashMap;

use corrvol_core::opaque_adapters::{record_correlation, register_opaque_vjps};
use corrvol_core::tape::{is_tape_active, with_tape, OpaqueVjp, TapeOp};
use corrvol_core::{correlation_backward, CorrelationConfig, CorrelationError, SimpleRng, Volume};

fn assert_close(actual: &[f32], expected: &[f32], tol: f32, msg: &str) {
    assert_eq!(actual.len(), expected.len(), "{msg}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < tol, "{msg}[{i}]: actual={a} expected={e}");
    }
}

#[test]
fn test_scaled_cost_volume_loss_3d() {
    // loss = <0.5 * corr(a, b), w>  =>  d/da = 0.5 * backward(w).0
    let shape = [1, 2, 3, 4, 3];
    let cfg = CorrelationConfig::uniform(3, 3, 3, 1, 1, 1, 1);
    let mut rng = SimpleRng::new(55);
    let a: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);
    let b: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);

    let (grad_a, grad_b, w) = with_tape(register_opaque_vjps(), |tape| {
        assert!(is_tape_active());
        let a_id = tape.register_input(a.data(), shape.to_vec());
        let b_id = tape.register_input(b.data(), shape.to_vec());
        let cost = cfg.record_on_tape(tape, a_id, b_id).unwrap();
        let cost_shape = tape.buf_shape(cost).to_vec();
        let scaled_data: Vec<f32> = tape.buf_data(cost).iter().map(|x| 0.5 * x).collect();
        let scaled = tape.record_with_output(scaled_data, cost_shape.clone(),
            |out| TapeOp::Scale { input: cost, scalar: 0.5, out });

        let w: Volume<f32> = Volume::random(&cost_shape, &mut SimpleRng::new(56), 1.0);
        let w_id = tape.register_input(w.data(), cost_shape);
        let loss = tape.record_with_output(vec![0.0], vec![1],
            |out| TapeOp::FrobeniusDot { a: scaled, b: w_id, out });
        tape.backward(loss);
        (tape.get_grad_or_zeros(a_id), tape.get_grad_or_zeros(b_id), w)
    });
    assert!(!is_tape_active());

    let (g1, g2) = correlation_backward(&a, &b, &w, &cfg).unwrap();
    let half1: Vec<f32> = g1.data().iter().map(|x| 0.5 * x).collect();
    let half2: Vec<f32> = g2.data().iter().map(|x| 0.5 * x).collect();
    assert_close(&grad_a, &half1, 1e-5, "d_a");
    assert_close(&grad_b, &half2, 1e-5, "d_b");
}

#[test]
fn test_two_correlations_share_input() {
    // loss = sum(corr(a, b)) + sum(corr(a, c)): gradient into a accumulates
    // from both opaque blocks.
    let shape = [2, 1, 3, 3];
    let cfg = CorrelationConfig::uniform(2, 1, 3, 0, 1, 1, 1);
    let mut rng = SimpleRng::new(60);
    let a: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);
    let b: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);
    let c: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);

    let grad_a = with_tape(register_opaque_vjps(), |tape| {
        let a_id = tape.register_input(a.data(), shape.to_vec());
        let b_id = tape.register_input(b.data(), shape.to_vec());
        let c_id = tape.register_input(c.data(), shape.to_vec());
        let ab = record_correlation(tape, a_id, b_id, &cfg).unwrap();
        let ac = record_correlation(tape, a_id, c_id, &cfg).unwrap();
        let shape_out = tape.buf_shape(ab).to_vec();
        let sum = tape.record_with_output(vec![0.0; tape.buf_numel(ab)], shape_out,
            |out| TapeOp::Add { a: ab, b: ac, out });
        let n = tape.buf_numel(sum);
        tape.seed_grad(sum, vec![1.0; n]);
        tape.backward(sum);
        tape.get_grad_or_zeros(a_id)
    });

    let ones = Volume::filled(&[2, 3, 3, 3, 3], 1.0f32);
    let (from_b, _) = correlation_backward(&a, &b, &ones, &cfg).unwrap();
    let (from_c, _) = correlation_backward(&a, &c, &ones, &cfg).unwrap();
    let expected: Vec<f32> = from_b.data().iter().zip(from_c.data()).map(|(x, y)| x + y).collect();
    assert_close(&grad_a, &expected, 1e-5, "d_a");
}

#[test]
fn test_rejected_geometry_records_nothing() {
    let result = with_tape(register_opaque_vjps(), |tape| {
        let a = tape.register_input(&[1.0; 4], vec![1, 1, 2, 2]);
        let err = record_correlation(tape, a, a, &CorrelationConfig::uniform(2, 3, 1, 0, 1, 1, 1));
        (err, tape.num_ops())
    });
    assert!(matches!(result.0, Err(CorrelationError::DegenerateOutput { .. })));
    assert_eq!(result.1, 0);
}

#[test]
fn test_unregistered_tape_refuses_correlation() {
    let (result, bufs_before, bufs_after, ops) = with_tape(HashMap::new(), |tape| {
        let a = tape.register_input(&[1.0; 4], vec![1, 1, 2, 2]);
        let before = tape.num_bufs();
        let result = record_correlation(tape, a, a, &CorrelationConfig::unit_2d());
        (result, before, tape.num_bufs(), tape.num_ops())
    });
    assert!(matches!(result, Err(CorrelationError::Config(_))));
    assert_eq!(bufs_after, bufs_before);
    assert_eq!(ops, 0);
}

#[test]
fn test_masked_cost_volume_loss() {
    // loss = <corr(a, b) * mask, w>  =>  d/da = backward(mask * w).0
    let shape = [1, 2, 4, 4];
    let cfg = CorrelationConfig::uniform(2, 1, 3, 0, 1, 1, 1);
    let mut rng = SimpleRng::new(70);
    let a: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);
    let b: Volume<f32> = Volume::random(&shape, &mut rng, 1.0);
    let cost_shape = [1, 3, 3, 4, 4];
    let w: Volume<f32> = Volume::random(&cost_shape, &mut rng, 1.0);
    // Keep every other cost cell.
    let mask: Vec<f32> = (0..w.numel()).map(|i| (i % 2) as f32).collect();

    let (grad_a, grad_b) = with_tape(register_opaque_vjps(), |tape| {
        let a_id = tape.register_input(a.data(), shape.to_vec());
        let b_id = tape.register_input(b.data(), shape.to_vec());
        let cost = record_correlation(tape, a_id, b_id, &cfg).unwrap();
        let mask_id = tape.register_input(&mask, cost_shape.to_vec());
        let masked_data: Vec<f32> = tape.buf_data(cost).iter().zip(&mask).map(|(c, m)| c * m).collect();
        let masked = tape.record_with_output(masked_data, cost_shape.to_vec(),
            |out| TapeOp::Mul { a: cost, b: mask_id, out });
        let w_id = tape.register_input(w.data(), cost_shape.to_vec());
        let loss = tape.record_with_output(vec![0.0], vec![1],
            |out| TapeOp::FrobeniusDot { a: masked, b: w_id, out });
        tape.backward(loss);
        (tape.get_grad_or_zeros(a_id), tape.get_grad_or_zeros(b_id))
    });

    let masked_w = Volume::from_vec(
        w.data().iter().zip(&mask).map(|(x, m)| x * m).collect(),
        &cost_shape,
    ).unwrap();
    let (g1, g2) = correlation_backward(&a, &b, &masked_w, &cfg).unwrap();
    assert_close(&grad_a, g1.data(), 1e-5, "d_a");
    assert_close(&grad_b, g2.data(), 1e-5, "d_b");
}
