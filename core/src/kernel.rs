/// Window kernels: the per-(displacement, output cell) inner loops.
///
/// Both kernels walk channel-major, then kernel axes H, W, D. For a kernel
/// offset `q` on an axis the base position is `p1 = base + q * dilation` and the
/// shifted position is `p2 = p1 + shift`. A (p1, p2) pair contributes only if
/// p1 lies inside input 1 and p2 inside input 2 on that axis; otherwise it is
/// skipped (implicit zero padding, never clamped or wrapped).
///
/// 2D volumes run through the same loops with a unit trailing axis.

use crate::tensor::{Element, SampleView, VolumeLayout};

/// Sliding window shape: kernel extent and dilation per spatial axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub kernel: [usize; 3],
    pub dilation: [usize; 3],
}

/// True when `p1` fits an axis of length `n1` and `p2` one of length `n2`.
#[inline]
pub fn axis_pair_in_bounds(p1: isize, p2: isize, n1: usize, n2: usize) -> bool {
    p1 >= 0 && (p1 as usize) < n1 && p2 >= 0 && (p2 as usize) < n2
}

/// Base and shifted coordinates for kernel offset `q` on `axis`, or None if
/// either falls outside its volume.
#[inline]
fn axis_positions(
    axis: usize,
    q: usize,
    window: &Window,
    base: [isize; 3],
    shift: [isize; 3],
    n1: &[usize; 3],
    n2: &[usize; 3],
) -> Option<(usize, usize)> {
    let p1 = base[axis] + (q * window.dilation[axis]) as isize;
    let p2 = p1 + shift[axis];
    if axis_pair_in_bounds(p1, p2, n1[axis], n2[axis]) {
        Some((p1 as usize, p2 as usize))
    } else {
        None
    }
}

/// Channel-wise dot product of the input-1 window at `base` and the input-2
/// window at `base + shift`.
pub fn correlate_window<T: Element>(
    input1: SampleView<'_, T>,
    input2: SampleView<'_, T>,
    window: &Window,
    base: [isize; 3],
    shift: [isize; 3],
) -> T {
    let n1 = input1.layout.dims;
    let n2 = input2.layout.dims;
    let mut acc = T::zero();

    for c in 0..input1.layout.channels {
        for i in 0..window.kernel[0] {
            let Some((i1, i2)) = axis_positions(0, i, window, base, shift, &n1, &n2) else { continue };
            for j in 0..window.kernel[1] {
                let Some((j1, j2)) = axis_positions(1, j, window, base, shift, &n1, &n2) else { continue };
                for k in 0..window.kernel[2] {
                    let Some((k1, k2)) = axis_positions(2, k, window, base, shift, &n1, &n2) else { continue };
                    acc += input1.at(c, [i1, j1, k1]) * input2.at(c, [i2, j2, k2]);
                }
            }
        }
    }
    acc
}

/// Scatter upstream gradient `g` of one (displacement, output cell) pair into
/// the per-sample gradient buffers of both inputs.
///
/// Adds only (never overwrites): many calls hit the same elements of
/// `grad1` / `grad2` because windows overlap. Callers must not run two calls
/// on the same buffers concurrently.
pub fn scatter_window_grad<T: Element>(
    input1: SampleView<'_, T>,
    input2: SampleView<'_, T>,
    grad1: &mut [T],
    grad2: &mut [T],
    g: T,
    window: &Window,
    base: [isize; 3],
    shift: [isize; 3],
) {
    let l1: VolumeLayout = input1.layout;
    let l2: VolumeLayout = input2.layout;
    debug_assert_eq!(grad1.len(), l1.sample_len());
    debug_assert_eq!(grad2.len(), l2.sample_len());

    for c in 0..l1.channels {
        for i in 0..window.kernel[0] {
            let Some((i1, i2)) = axis_positions(0, i, window, base, shift, &l1.dims, &l2.dims) else { continue };
            for j in 0..window.kernel[1] {
                let Some((j1, j2)) = axis_positions(1, j, window, base, shift, &l1.dims, &l2.dims) else { continue };
                for k in 0..window.kernel[2] {
                    let Some((k1, k2)) = axis_positions(2, k, window, base, shift, &l1.dims, &l2.dims) else { continue };
                    let o1 = l1.offset(c, [i1, j1, k1]);
                    let o2 = l2.offset(c, [i2, j2, k2]);
                    grad1[o1] += g * input2.data[o2];
                    grad2[o2] += g * input1.data[o1];
                }
            }
        }
    }
}
