//! Backward parallel strategies: agreement, additivity over
//! (displacement, output cell) pairs, pool sizing.

use corrvol_core::geometry::Geometry;
use corrvol_core::{
    correlation_backward, correlation_backward_in, BackwardStrategy, CorrelationConfig,
    CorrelationError, ParallelConfig, SimpleRng, Volume,
};
use proptest::prelude::*;

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

struct Case {
    a: Volume<f64>,
    b: Volume<f64>,
    w: Volume<f64>,
    cfg: CorrelationConfig,
}

fn make_case(shape: &[usize], cfg: CorrelationConfig, seed: u64) -> Case {
    let mut rng = SimpleRng::new(seed);
    let a = Volume::random(shape, &mut rng, 1.0);
    let b = Volume::random(shape, &mut rng, 1.0);
    let cost_shape = Geometry::resolve(shape, shape, &cfg).unwrap().cost_volume_shape();
    let w = Volume::random(&cost_shape, &mut rng, 1.0);
    Case { a, b, w, cfg }
}

#[test]
fn test_additivity_over_pairs() {
    // Scatter each upstream cell on its own, sum the results in reverse cell
    // order, compare with one backward over the whole upstream volume.
    let case = make_case(&[2, 2, 3, 4], CorrelationConfig::uniform(2, 2, 3, 1, 1, 1, 1), 17);
    let (full1, full2) = correlation_backward(&case.a, &case.b, &case.w, &case.cfg).unwrap();

    let mut sum1 = vec![0.0; case.a.numel()];
    let mut sum2 = vec![0.0; case.b.numel()];
    for k in (0..case.w.numel()).rev() {
        let mut one_hot = Volume::zeros(case.w.shape());
        one_hot.data_mut()[k] = case.w.data()[k];
        let (g1, g2) = correlation_backward_in(
            &ParallelConfig::sequential(), &case.a, &case.b, &one_hot, &case.cfg,
        ).unwrap();
        for (s, g) in sum1.iter_mut().zip(g1.data()) {
            *s += g;
        }
        for (s, g) in sum2.iter_mut().zip(g2.data()) {
            *s += g;
        }
    }

    assert!(max_abs_diff(full1.data(), &sum1) < 1e-12);
    assert!(max_abs_diff(full2.data(), &sum2) < 1e-12);
}

#[test]
fn test_all_strategies_all_pool_sizes() {
    let cfg = CorrelationConfig::uniform(3, 2, 3, 1, 1, 2, 1);
    let case = make_case(&[3, 2, 4, 3, 4], cfg, 29);
    let reference = correlation_backward_in(
        &ParallelConfig::sequential(), &case.a, &case.b, &case.w, &case.cfg,
    ).unwrap();

    for backward in [BackwardStrategy::BatchParallel, BackwardStrategy::PrivateReduce] {
        for threads in [1, 2, 5] {
            let par = ParallelConfig { backward, num_threads: Some(threads) };
            let (g1, g2) = correlation_backward_in(&par, &case.a, &case.b, &case.w, &case.cfg).unwrap();
            assert!(max_abs_diff(g1.data(), reference.0.data()) < 1e-12, "{backward:?} x{threads}");
            assert!(max_abs_diff(g2.data(), reference.1.data()) < 1e-12, "{backward:?} x{threads}");
        }
    }
}

#[test]
fn test_batch_parallel_is_deterministic() {
    // Each sample is scattered by one worker in a fixed order, so repeated
    // runs are bitwise identical regardless of scheduling.
    let case = make_case(&[4, 2, 5, 5], CorrelationConfig::uniform(2, 3, 5, 1, 1, 1, 1), 31);
    let par = ParallelConfig::batch_parallel().with_threads(4);
    let first = correlation_backward_in(&par, &case.a, &case.b, &case.w, &case.cfg).unwrap();
    for _ in 0..3 {
        let again = correlation_backward_in(&par, &case.a, &case.b, &case.w, &case.cfg).unwrap();
        assert_eq!(first, again);
    }
}

#[test]
fn test_zero_threads_rejected_before_work() {
    let case = make_case(&[1, 1, 2, 2], CorrelationConfig::unit_2d(), 1);
    let par = ParallelConfig::private_reduce().with_threads(0);
    let err = correlation_backward_in(&par, &case.a, &case.b, &case.w, &case.cfg).unwrap_err();
    assert!(matches!(err, CorrelationError::Config(_)));
}

#[test]
fn test_empty_batch_all_strategies() {
    let a = Volume::<f64>::zeros(&[0, 2, 3, 3]);
    let cfg = CorrelationConfig::uniform(2, 1, 3, 0, 1, 1, 1);
    let w = Volume::<f64>::zeros(&[0, 3, 3, 3, 3]);
    for par in [ParallelConfig::sequential(), ParallelConfig::batch_parallel(), ParallelConfig::private_reduce()] {
        let (g1, g2) = correlation_backward_in(&par, &a, &a, &w, &cfg).unwrap();
        assert_eq!(g1.shape(), &[0, 2, 3, 3]);
        assert_eq!(g2.numel(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_private_reduce_matches_sequential(
        batch in 1usize..4,
        channels in 1usize..3,
        h in 2usize..5,
        w in 2usize..5,
        kernel in 1usize..3,
        patch in 1usize..4,
        padding in 0usize..2,
        dilation_patch in 0usize..3,
        stride in 1usize..3,
        seed in 1u64..1000,
    ) {
        let cfg = CorrelationConfig::uniform(2, kernel, patch, padding, 1, dilation_patch, stride);
        let case = make_case(&[batch, channels, h, w], cfg, seed);
        let seq = correlation_backward_in(
            &ParallelConfig::sequential(), &case.a, &case.b, &case.w, &case.cfg,
        ).unwrap();
        let red = correlation_backward_in(
            &ParallelConfig::private_reduce(), &case.a, &case.b, &case.w, &case.cfg,
        ).unwrap();
        prop_assert!(max_abs_diff(seq.0.data(), red.0.data()) < 1e-12);
        prop_assert!(max_abs_diff(seq.1.data(), red.1.data()) < 1e-12);
    }
}
