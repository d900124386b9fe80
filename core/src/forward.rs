/// Forward correlation: build the cost volume.
///
/// Output cell (n, ph, pw, pd, oh, ow, od) is the window dot product of
/// input 1 at base(oh, ow, od) and input 2 at base + shift(ph, pw, pd).
/// The cost volume is split into (batch, pH, pW) blocks of
/// pD * oH * oW * oD contiguous cells, one rayon task per block. Blocks are
/// disjoint, so workers never share an output element.

use rayon::prelude::*;
use tracing::debug;

use crate::error::CorrelationError;
use crate::geometry::{unravel3, CorrelationConfig, Geometry};
use crate::kernel::correlate_window;
use crate::parallel::ParallelConfig;
use crate::tensor::{Element, SampleView, Volume};

/// Cost volume of `input1` against `input2` on rayon's global pool.
///
/// Shapes: inputs [B, C, H, W] or [B, C, H, W, D]; output
/// [B, pH, pW, oH, oW] or [B, pH, pW, pD, oH, oW, oD].
pub fn correlation_forward<T: Element>(
    input1: &Volume<T>,
    input2: &Volume<T>,
    cfg: &CorrelationConfig,
) -> Result<Volume<T>, CorrelationError> {
    let geom = Geometry::resolve(input1.shape(), input2.shape(), cfg)?;
    Ok(forward_resolved(input1, input2, &geom))
}

/// Same as [`correlation_forward`], run on the pool described by `par`.
pub fn correlation_forward_in<T: Element>(
    par: &ParallelConfig,
    input1: &Volume<T>,
    input2: &Volume<T>,
    cfg: &CorrelationConfig,
) -> Result<Volume<T>, CorrelationError> {
    let geom = Geometry::resolve(input1.shape(), input2.shape(), cfg)?;
    par.install(|| forward_resolved(input1, input2, &geom))
}

pub(crate) fn forward_resolved<T: Element>(
    input1: &Volume<T>,
    input2: &Volume<T>,
    geom: &Geometry,
) -> Volume<T> {
    let out_shape = geom.cost_volume_shape();
    let dtype = T::DTYPE;
    debug!(
        input1 = ?input1.shape(),
        input2 = ?input2.shape(),
        output = ?out_shape,
        dtype = %dtype,
        "correlation forward"
    );

    let mut out = Volume::zeros(&out_shape);
    let [ph_n, pw_n, pd_n] = geom.patch_dims();
    let out_dims = geom.out_dims();
    let out_cells = geom.out_cells();
    let window = geom.window();

    out.data_mut()
        .par_chunks_mut(pd_n * out_cells)
        .enumerate()
        .for_each(|(block, cells)| {
            let n = block / (ph_n * pw_n);
            let ph = (block / pw_n) % ph_n;
            let pw = block % pw_n;
            let s1 = SampleView::of(input1, geom.input1, n);
            let s2 = SampleView::of(input2, geom.input2, n);

            for (pd, plane) in cells.chunks_mut(out_cells).enumerate() {
                let shift = geom.shift([ph, pw, pd]);
                for (o, cell) in plane.iter_mut().enumerate() {
                    let base = geom.base(unravel3(o, out_dims));
                    *cell += correlate_window(s1, s2, &window, base, shift);
                }
            }
        });

    out
}
