/// Correlation geometry: configuration and its resolution against volumes.
///
/// `CorrelationConfig` is the caller-facing description (one entry per spatial
/// axis, 2 or 3 axes). `Geometry` is the validated form bound to two concrete
/// input shapes, always carrying three axes; a 2D config gains a trailing unit
/// axis (kernel 1, patch 1, no padding, stride 1).
///
/// Per axis:
///   dilated_kernel = (kernel - 1) * dilation + 1
///   out            = (input + 2 * padding - dilated_kernel) / stride + 1
///   patch_radius   = (patch - 1) / 2
///   shift(p)       = (p - patch_radius) * dilation_patch
///   base(o)        = -padding + o * stride

use serde::{Deserialize, Serialize};

use crate::error::CorrelationError;
use crate::kernel::Window;
use crate::tensor::VolumeLayout;

/// Caller-supplied geometry. Every vector holds one entry per spatial axis
/// (H, W) or (H, W, D).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    pub kernel_size: Vec<usize>,
    pub patch_size: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
    pub dilation_patch: Vec<usize>,
    pub stride: Vec<usize>,
}

impl CorrelationConfig {
    /// Same value on every axis.
    pub fn uniform(
        spatial_rank: usize,
        kernel_size: usize,
        patch_size: usize,
        padding: usize,
        dilation: usize,
        dilation_patch: usize,
        stride: usize,
    ) -> Self {
        CorrelationConfig {
            kernel_size: vec![kernel_size; spatial_rank],
            patch_size: vec![patch_size; spatial_rank],
            padding: vec![padding; spatial_rank],
            dilation: vec![dilation; spatial_rank],
            dilation_patch: vec![dilation_patch; spatial_rank],
            stride: vec![stride; spatial_rank],
        }
    }

    /// Kernel 1, patch 1, no padding, unit dilation and stride (2D).
    pub fn unit_2d() -> Self {
        Self::uniform(2, 1, 1, 0, 1, 1, 1)
    }

    /// Kernel 1, patch 1, no padding, unit dilation and stride (3D).
    pub fn unit_3d() -> Self {
        Self::uniform(3, 1, 1, 0, 1, 1, 1)
    }

    pub fn from_json_str(json: &str) -> Result<Self, CorrelationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, CorrelationError> {
        Ok(serde_json::to_string(self)?)
    }

    fn params(&self) -> [(&'static str, &[usize]); 6] {
        [
            ("kernel_size", self.kernel_size.as_slice()),
            ("patch_size", self.patch_size.as_slice()),
            ("padding", self.padding.as_slice()),
            ("dilation", self.dilation.as_slice()),
            ("dilation_patch", self.dilation_patch.as_slice()),
            ("stride", self.stride.as_slice()),
        ]
    }
}

/// One resolved spatial axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisGeometry {
    pub kernel: usize,
    pub patch: usize,
    pub padding: usize,
    pub dilation: usize,
    pub dilation_patch: usize,
    pub stride: usize,
    /// Output extent along this axis.
    pub out: usize,
}

impl AxisGeometry {
    fn unit() -> Self {
        AxisGeometry { kernel: 1, patch: 1, padding: 0, dilation: 1, dilation_patch: 1, stride: 1, out: 1 }
    }

    pub fn dilated_kernel(&self) -> usize {
        dilated_kernel(self.kernel, self.dilation)
    }

    pub fn patch_radius(&self) -> usize {
        (self.patch - 1) / 2
    }

    /// Displacement for patch index `p`.
    #[inline]
    pub fn shift(&self, p: usize) -> isize {
        (p as isize - self.patch_radius() as isize) * self.dilation_patch as isize
    }

    /// Window origin (in input coordinates) for output index `o`. In range
    /// for every `o < out` of an axis built by [`Geometry::resolve`].
    #[inline]
    pub fn base(&self, o: usize) -> isize {
        -(self.padding as isize) + (o * self.stride) as isize
    }
}

pub fn dilated_kernel(kernel: usize, dilation: usize) -> usize {
    (kernel - 1) * dilation + 1
}

fn checked_dilated_kernel(kernel: usize, dilation: usize) -> Option<usize> {
    (kernel - 1).checked_mul(dilation)?.checked_add(1)
}

/// `input + 2 * padding`, or None if it overflows.
fn checked_padded(input: usize, padding: usize) -> Option<usize> {
    padding.checked_mul(2)?.checked_add(input)
}

/// Output extent of one axis, or None when the padded input is shorter than
/// the dilated kernel or either extent overflows. Requires kernel, dilation,
/// stride >= 1.
pub fn output_dim(input: usize, kernel: usize, padding: usize, dilation: usize, stride: usize) -> Option<usize> {
    let padded = checked_padded(input, padding)?;
    let dk = checked_dilated_kernel(kernel, dilation)?;
    if padded < dk {
        return None;
    }
    Some((padded - dk) / stride + 1)
}

/// Largest element count a volume may hold: its bytes must fit `isize`
/// for the widest supported element (f64).
pub const MAX_VOLUME_ELEMENTS: usize = isize::MAX as usize / std::mem::size_of::<f64>();

fn checked_len(dims: &[usize]) -> Option<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .filter(|&n| n <= MAX_VOLUME_ELEMENTS)
}

/// Whole volume and one batch sample both within [`MAX_VOLUME_ELEMENTS`].
/// The sample is checked on its own because an empty batch hides it.
fn representable(shape: &[usize]) -> bool {
    checked_len(shape).is_some() && checked_len(&shape[1..]).is_some()
}

/// Row-major unravel of a flat index over three extents.
#[inline]
pub fn unravel3(idx: usize, dims: [usize; 3]) -> [usize; 3] {
    let k = idx % dims[2];
    let j = (idx / dims[2]) % dims[1];
    let i = idx / (dims[2] * dims[1]);
    [i, j, k]
}

/// Resolve axis `a`. Input-1 positions span `[-padding, input + padding)`
/// and input-2 positions add at most `reach` on either side, so requiring
/// `padded + reach <= isize::MAX` keeps every base, shift and window sum in
/// range.
fn resolve_axis(a: usize, input: usize, cfg: &CorrelationConfig) -> Result<AxisGeometry, CorrelationError> {
    let (kernel, patch, padding, dilation, dilation_patch, stride) = (
        cfg.kernel_size[a], cfg.patch_size[a], cfg.padding[a],
        cfg.dilation[a], cfg.dilation_patch[a], cfg.stride[a],
    );
    let invalid = |param, value| CorrelationError::InvalidGeometry { param, axis: a, value };
    let isize_max = isize::MAX as usize;

    let padded = checked_padded(input, padding)
        .filter(|&p| p <= isize_max)
        .ok_or(invalid("padding", padding))?;
    let dk = checked_dilated_kernel(kernel, dilation)
        .filter(|&d| d <= isize_max)
        .ok_or(invalid("dilation", dilation))?;
    if patch > isize_max {
        return Err(invalid("patch_size", patch));
    }
    // Largest |shift|: the upper side of the patch is never shorter.
    let span = (patch - 1 - (patch - 1) / 2)
        .checked_mul(dilation_patch)
        .and_then(|reach| reach.checked_add(padded))
        .filter(|&s| s <= isize_max);
    if span.is_none() {
        return Err(invalid("dilation_patch", dilation_patch));
    }
    let out = output_dim(input, kernel, padding, dilation, stride).ok_or(
        CorrelationError::DegenerateOutput { axis: a, input, padding, dilated_kernel: dk },
    )?;

    Ok(AxisGeometry { kernel, patch, padding, dilation, dilation_patch, stride, out })
}

/// Geometry validated against two input shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub input1: VolumeLayout,
    pub input2: VolumeLayout,
    pub axes: [AxisGeometry; 3],
}

impl Geometry {
    /// Validate shapes and config; no buffers are touched.
    ///
    /// Besides the shape checks, every coordinate the kernels compute must
    /// fit `isize` and every volume involved (both inputs and the cost
    /// volume) must stay within [`MAX_VOLUME_ELEMENTS`].
    pub fn resolve(
        shape1: &[usize],
        shape2: &[usize],
        cfg: &CorrelationConfig,
    ) -> Result<Self, CorrelationError> {
        let input1 = VolumeLayout::of(shape1)?;
        let input2 = VolumeLayout::of(shape2)?;
        for (what, shape) in [("input1", shape1), ("input2", shape2)] {
            if !representable(shape) {
                return Err(CorrelationError::SizeOverflow { what, shape: shape.to_vec() });
            }
        }

        if input1.spatial_rank != input2.spatial_rank {
            return Err(CorrelationError::RankMismatch { left: shape1.len(), right: shape2.len() });
        }
        for shape in [shape1, shape2] {
            if shape[1..].contains(&0) {
                return Err(CorrelationError::EmptyVolume { shape: shape.to_vec() });
            }
        }
        if input1.batch != input2.batch {
            return Err(CorrelationError::BatchMismatch { left: input1.batch, right: input2.batch });
        }
        if input1.channels != input2.channels {
            return Err(CorrelationError::ChannelMismatch {
                left: input1.channels, right: input2.channels,
            });
        }

        let rank = input1.spatial_rank;
        for (param, values) in cfg.params() {
            if values.len() != rank {
                return Err(CorrelationError::GeometryRank { param, expected: rank, got: values.len() });
            }
        }
        for (param, values) in [
            ("kernel_size", &cfg.kernel_size),
            ("patch_size", &cfg.patch_size),
            ("dilation", &cfg.dilation),
            ("stride", &cfg.stride),
        ] {
            if let Some(axis) = values.iter().position(|&v| v == 0) {
                return Err(CorrelationError::InvalidGeometry { param, axis, value: 0 });
            }
        }

        let mut axes = [AxisGeometry::unit(); 3];
        for (a, axis) in axes.iter_mut().enumerate().take(rank) {
            *axis = resolve_axis(a, input1.dims[a], cfg)?;
        }

        let geom = Geometry { input1, input2, axes };
        let cost_shape = geom.cost_volume_shape();
        if !representable(&cost_shape) {
            return Err(CorrelationError::SizeOverflow { what: "cost volume", shape: cost_shape });
        }
        Ok(geom)
    }

    pub fn spatial_rank(&self) -> usize {
        self.input1.spatial_rank
    }

    pub fn batch(&self) -> usize {
        self.input1.batch
    }

    pub fn patch_dims(&self) -> [usize; 3] {
        [self.axes[0].patch, self.axes[1].patch, self.axes[2].patch]
    }

    pub fn out_dims(&self) -> [usize; 3] {
        [self.axes[0].out, self.axes[1].out, self.axes[2].out]
    }

    /// Number of displacements per sample (pH * pW * pD).
    pub fn displacements(&self) -> usize {
        self.patch_dims().iter().product()
    }

    /// Number of output locations per displacement (oH * oW * oD).
    pub fn out_cells(&self) -> usize {
        self.out_dims().iter().product()
    }

    /// [B, pH, pW, oH, oW] for 2D, [B, pH, pW, pD, oH, oW, oD] for 3D.
    pub fn cost_volume_shape(&self) -> Vec<usize> {
        let rank = self.spatial_rank();
        let mut shape = Vec::with_capacity(1 + 2 * rank);
        shape.push(self.batch());
        shape.extend(self.axes[..rank].iter().map(|a| a.patch));
        shape.extend(self.axes[..rank].iter().map(|a| a.out));
        shape
    }

    pub fn window(&self) -> Window {
        Window {
            kernel: [self.axes[0].kernel, self.axes[1].kernel, self.axes[2].kernel],
            dilation: [self.axes[0].dilation, self.axes[1].dilation, self.axes[2].dilation],
        }
    }

    #[inline]
    pub fn shift(&self, p: [usize; 3]) -> [isize; 3] {
        [self.axes[0].shift(p[0]), self.axes[1].shift(p[1]), self.axes[2].shift(p[2])]
    }

    #[inline]
    pub fn base(&self, o: [usize; 3]) -> [isize; 3] {
        [self.axes[0].base(o[0]), self.axes[1].base(o[1]), self.axes[2].base(o[2])]
    }
}
