/// Minimal volume utilities.
///
/// Volumes are flat row-major buffers with shape metadata, generic over the
/// element type. Feature volumes are [B, C, H, W] (2D) or [B, C, H, W, D] (3D).
/// A 2D volume is addressed as 3D with a unit trailing axis; the row-major
/// layout of [B, C, H, W] and [B, C, H, W, 1] is identical, so no copy is made.

use std::fmt;
use std::fmt::Debug;
use std::ops::AddAssign;

use num_traits::{Float, Zero};
use serde::{Deserialize, Serialize};

use crate::error::CorrelationError;

// ── Element types ────────────────────────────────────────────────────

/// Element kinds a volume may carry. Only the floating kinds are correlated;
/// the integer kinds exist so dispatch can reject them by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// Floating element the correlation kernels are instantiated for.
pub trait Element: Float + AddAssign + Send + Sync + Debug + 'static {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

// ── Volume ───────────────────────────────────────────────────────────

/// Flat row-major volume with shape metadata. `data.len()` always equals the
/// product of `shape`.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume<T> {
    data: Vec<T>,
    shape: Vec<usize>,
}

impl<T: Clone + Zero> Volume<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Volume {
            data: vec![T::zero(); n],
            shape: shape.to_vec(),
        }
    }
}

impl<T: Clone> Volume<T> {
    pub fn filled(shape: &[usize], value: T) -> Self {
        let n: usize = shape.iter().product();
        Volume {
            data: vec![value; n],
            shape: shape.to_vec(),
        }
    }
}

impl<T> Volume<T> {
    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self, CorrelationError> {
        let n: usize = shape.iter().product();
        if data.len() != n {
            return Err(CorrelationError::DataLength { len: data.len(), shape: shape.to_vec() });
        }
        Ok(Volume { data, shape: shape.to_vec() })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Row-major flat offset of a full multi-index, or None if out of range.
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut off = 0;
        for (&i, &n) in index.iter().zip(self.shape.iter()) {
            if i >= n {
                return None;
            }
            off = off * n + i;
        }
        Some(off)
    }

    pub fn get_mut(&mut self, index: &[usize]) -> Option<&mut T> {
        let off = self.offset(index)?;
        self.data.get_mut(off)
    }

    /// Write one element. Returns false (and writes nothing) if out of range.
    pub fn set(&mut self, index: &[usize], value: T) -> bool {
        match self.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl<T: Copy> Volume<T> {
    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.offset(index).map(|off| self.data[off])
    }
}

impl<T: Element> Volume<T> {
    /// Volume with uniform values in [-scale, scale].
    pub fn random(shape: &[usize], rng: &mut SimpleRng, scale: f64) -> Self {
        let mut v = Volume::zeros(shape);
        rng.fill_uniform(&mut v.data, scale);
        v
    }
}

// ── Per-sample layout ────────────────────────────────────────────────

/// Shape of a feature volume seen as [batch, channels, H, W, D].
/// `spatial_rank` is 2 or 3; for 2D, `dims[2] == 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeLayout {
    pub batch: usize,
    pub channels: usize,
    pub dims: [usize; 3],
    pub spatial_rank: usize,
}

impl VolumeLayout {
    pub fn of(shape: &[usize]) -> Result<Self, CorrelationError> {
        match *shape {
            [batch, channels, h, w] => Ok(VolumeLayout {
                batch, channels, dims: [h, w, 1], spatial_rank: 2,
            }),
            [batch, channels, h, w, d] => Ok(VolumeLayout {
                batch, channels, dims: [h, w, d], spatial_rank: 3,
            }),
            _ => Err(CorrelationError::UnsupportedRank { rank: shape.len() }),
        }
    }

    /// Elements in one batch sample: C * H * W * D.
    pub fn sample_len(&self) -> usize {
        self.channels * self.dims.iter().product::<usize>()
    }

    /// Flat offset of (c, p) within one sample.
    #[inline]
    pub fn offset(&self, c: usize, p: [usize; 3]) -> usize {
        ((c * self.dims[0] + p[0]) * self.dims[1] + p[1]) * self.dims[2] + p[2]
    }
}

/// Read-only [C, H, W, D] slice of one batch sample.
#[derive(Clone, Copy, Debug)]
pub struct SampleView<'a, T> {
    pub data: &'a [T],
    pub layout: VolumeLayout,
}

impl<'a, T: Copy> SampleView<'a, T> {
    /// View of sample `n` of `volume`, which must match `layout`.
    pub fn of(volume: &'a Volume<T>, layout: VolumeLayout, n: usize) -> Self {
        let len = layout.sample_len();
        debug_assert_eq!(volume.numel(), layout.batch * len);
        SampleView { data: &volume.data[n * len..(n + 1) * len], layout }
    }

    #[inline]
    pub fn at(&self, c: usize, p: [usize; 3]) -> T {
        self.data[self.layout.offset(c, p)]
    }
}

// ── Deterministic RNG ────────────────────────────────────────────────

/// Xorshift64 generator for reproducible test and benchmark inputs.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f64) -> f64 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u - 1.0) * scale
    }

    pub fn fill_uniform<T: Element>(&mut self, buf: &mut [T], scale: f64) {
        for v in buf.iter_mut() {
            *v = <T as num_traits::NumCast>::from(self.uniform(scale)).unwrap_or_else(T::zero);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_numel() {
        let v: Volume<f32> = Volume::zeros(&[2, 3, 4, 5]);
        assert_eq!(v.numel(), 120);
        assert!(v.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        let err = Volume::from_vec(vec![1.0f32; 5], &[2, 3]).unwrap_err();
        assert_eq!(err, CorrelationError::DataLength { len: 5, shape: vec![2, 3] });
    }

    #[test]
    fn test_multi_index_access() {
        let mut v: Volume<f64> = Volume::zeros(&[2, 3, 4]);
        *v.get_mut(&[1, 2, 3]).unwrap() = 7.5;
        assert_eq!(v.get(&[1, 2, 3]), Some(7.5));
        assert_eq!(v.data()[23], 7.5);
        assert_eq!(v.get(&[2, 0, 0]), None);
        assert_eq!(v.get(&[0, 0]), None);
    }

    #[test]
    fn test_layout_2d_has_unit_depth() {
        let l = VolumeLayout::of(&[2, 3, 4, 5]).unwrap();
        assert_eq!(l.dims, [4, 5, 1]);
        assert_eq!(l.spatial_rank, 2);
        assert_eq!(l.sample_len(), 60);
        assert_eq!(l.offset(1, [2, 3, 0]), 20 + 2 * 5 + 3);
    }

    #[test]
    fn test_layout_rejects_rank() {
        assert_eq!(
            VolumeLayout::of(&[1, 2, 3]),
            Err(CorrelationError::UnsupportedRank { rank: 3 })
        );
    }

    #[test]
    fn test_sample_view_matches_multi_index() {
        let mut rng = SimpleRng::new(7);
        let v: Volume<f32> = Volume::random(&[2, 2, 3, 4, 5], &mut rng, 1.0);
        let layout = VolumeLayout::of(v.shape()).unwrap();
        let s = SampleView::of(&v, layout, 1);
        assert_eq!(s.at(1, [2, 3, 4]), v.get(&[1, 1, 2, 3, 4]).unwrap());
    }

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);
        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_uniform_range() {
        let mut rng = SimpleRng::new(3);
        for _ in 0..1000 {
            let x = rng.uniform(0.5);
            assert!((-0.5..=0.5).contains(&x));
        }
    }
}
