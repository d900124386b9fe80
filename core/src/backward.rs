/// Backward correlation: scatter the cost-volume gradient into both inputs.
///
/// For each (displacement, output cell) pair with upstream gradient g, every
/// valid window pair (p1, p2) adds g * input2[c, p2] into grad1[c, p1] and
/// g * input1[c, p1] into grad2[c, p2]. Windows overlap, so one gradient
/// element receives many adds. Parallel safety comes from the strategy:
///
///   BatchParallel  split by sample only; a sample's gradient slices belong to
///                  exactly one worker.
///   PrivateReduce  split by sample, then by displacement within it; each
///                  rayon split owns private one-sample buffers, summed into
///                  the sample's slices.
///   Sequential     one thread.
///
/// Gradients are zero-initialised and only ever added to.

use std::ops::Range;

use rayon::prelude::*;
use tracing::debug;

use crate::error::CorrelationError;
use crate::geometry::{unravel3, CorrelationConfig, Geometry};
use crate::kernel::{scatter_window_grad, Window};
use crate::parallel::{BackwardStrategy, ParallelConfig};
use crate::tensor::{Element, SampleView, Volume};

/// Gradients w.r.t. `input1` and `input2` given `grad_output`, the gradient
/// of the cost volume. Uses [`BackwardStrategy::BatchParallel`] on rayon's
/// global pool.
pub fn correlation_backward<T: Element>(
    input1: &Volume<T>,
    input2: &Volume<T>,
    grad_output: &Volume<T>,
    cfg: &CorrelationConfig,
) -> Result<(Volume<T>, Volume<T>), CorrelationError> {
    let geom = resolve_backward(input1, input2, grad_output, cfg)?;
    Ok(backward_resolved(BackwardStrategy::default(), input1, input2, grad_output, &geom))
}

/// Backward with the strategy and pool described by `par`.
pub fn correlation_backward_in<T: Element>(
    par: &ParallelConfig,
    input1: &Volume<T>,
    input2: &Volume<T>,
    grad_output: &Volume<T>,
    cfg: &CorrelationConfig,
) -> Result<(Volume<T>, Volume<T>), CorrelationError> {
    let geom = resolve_backward(input1, input2, grad_output, cfg)?;
    par.install(|| backward_resolved(par.backward, input1, input2, grad_output, &geom))
}

fn resolve_backward<T: Element>(
    input1: &Volume<T>,
    input2: &Volume<T>,
    grad_output: &Volume<T>,
    cfg: &CorrelationConfig,
) -> Result<Geometry, CorrelationError> {
    let geom = Geometry::resolve(input1.shape(), input2.shape(), cfg)?;
    let expected = geom.cost_volume_shape();
    if grad_output.shape() != expected.as_slice() {
        return Err(CorrelationError::GradShapeMismatch {
            expected,
            got: grad_output.shape().to_vec(),
        });
    }
    Ok(geom)
}

pub(crate) fn backward_resolved<T: Element>(
    strategy: BackwardStrategy,
    input1: &Volume<T>,
    input2: &Volume<T>,
    grad_output: &Volume<T>,
    geom: &Geometry,
) -> (Volume<T>, Volume<T>) {
    let dtype = T::DTYPE;
    debug!(
        input1 = ?input1.shape(),
        input2 = ?input2.shape(),
        grad_output = ?grad_output.shape(),
        dtype = %dtype,
        ?strategy,
        "correlation backward"
    );

    let pass = BackwardPass::new(input1, input2, grad_output, geom);
    match strategy {
        BackwardStrategy::BatchParallel => pass.batch_parallel(),
        BackwardStrategy::PrivateReduce => pass.private_reduce(),
        BackwardStrategy::Sequential => pass.sequential(),
    }
}

/// Shared read-only state of one backward call.
struct BackwardPass<'a, T> {
    input1: &'a Volume<T>,
    input2: &'a Volume<T>,
    grad_output: &'a Volume<T>,
    geom: &'a Geometry,
    window: Window,
    /// Cost-volume elements per sample: displacements * out_cells.
    cost_len: usize,
}

impl<'a, T: Element> BackwardPass<'a, T> {
    fn new(
        input1: &'a Volume<T>,
        input2: &'a Volume<T>,
        grad_output: &'a Volume<T>,
        geom: &'a Geometry,
    ) -> Self {
        BackwardPass {
            input1,
            input2,
            grad_output,
            geom,
            window: geom.window(),
            cost_len: geom.displacements() * geom.out_cells(),
        }
    }

    /// Scatter displacements `range` of sample `n` into that sample's
    /// gradient slices. Visits displacements, then output cells, row-major.
    fn scatter_sample(&self, n: usize, range: Range<usize>, g1: &mut [T], g2: &mut [T]) {
        let geom = self.geom;
        let s1 = SampleView::of(self.input1, geom.input1, n);
        let s2 = SampleView::of(self.input2, geom.input2, n);
        let upstream = &self.grad_output.data()[n * self.cost_len..(n + 1) * self.cost_len];
        let patch_dims = geom.patch_dims();
        let out_dims = geom.out_dims();
        let out_cells = geom.out_cells();

        for d in range {
            let shift = geom.shift(unravel3(d, patch_dims));
            let plane = &upstream[d * out_cells..(d + 1) * out_cells];
            for (o, &g) in plane.iter().enumerate() {
                let base = geom.base(unravel3(o, out_dims));
                scatter_window_grad(s1, s2, g1, g2, g, &self.window, base, shift);
            }
        }
    }

    fn zeroed(&self) -> (Volume<T>, Volume<T>) {
        (Volume::zeros(self.input1.shape()), Volume::zeros(self.input2.shape()))
    }

    fn batch_parallel(&self) -> (Volume<T>, Volume<T>) {
        let (mut grad1, mut grad2) = self.zeroed();
        let len1 = self.geom.input1.sample_len();
        let len2 = self.geom.input2.sample_len();
        let displacements = self.geom.displacements();

        grad1.data_mut()
            .par_chunks_mut(len1)
            .zip(grad2.data_mut().par_chunks_mut(len2))
            .enumerate()
            .for_each(|(n, (g1, g2))| self.scatter_sample(n, 0..displacements, g1, g2));

        (grad1, grad2)
    }

    fn sequential(&self) -> (Volume<T>, Volume<T>) {
        let (mut grad1, mut grad2) = self.zeroed();
        let len1 = self.geom.input1.sample_len();
        let len2 = self.geom.input2.sample_len();
        let displacements = self.geom.displacements();

        for (n, (g1, g2)) in grad1.data_mut()
            .chunks_mut(len1)
            .zip(grad2.data_mut().chunks_mut(len2))
            .enumerate()
        {
            self.scatter_sample(n, 0..displacements, g1, g2);
        }

        (grad1, grad2)
    }

    fn private_reduce(&self) -> (Volume<T>, Volume<T>) {
        let (mut grad1, mut grad2) = self.zeroed();
        let len1 = self.geom.input1.sample_len();
        let len2 = self.geom.input2.sample_len();
        let displacements = self.geom.displacements();
        let sample_zeros = || (vec![T::zero(); len1], vec![T::zero(); len2]);

        grad1.data_mut()
            .par_chunks_mut(len1)
            .zip(grad2.data_mut().par_chunks_mut(len2))
            .enumerate()
            .for_each(|(n, (g1, g2))| {
                let (p1, p2) = (0..displacements)
                    .into_par_iter()
                    .fold(sample_zeros, |(mut p1, mut p2), d| {
                        self.scatter_sample(n, d..d + 1, &mut p1, &mut p2);
                        (p1, p2)
                    })
                    .reduce(sample_zeros, |(mut a1, mut a2), (b1, b2)| {
                        add_into(&mut a1, &b1);
                        add_into(&mut a2, &b2);
                        (a1, a2)
                    });
                add_into(g1, &p1);
                add_into(g2, &p2);
            });

        (grad1, grad2)
    }
}

fn add_into<T: Element>(acc: &mut [T], other: &[T]) {
    for (a, &b) in acc.iter_mut().zip(other) {
        *a += b;
    }
}
