/// Runtime element-type dispatch.
///
/// Callers holding volumes whose element kind is only known at runtime wrap
/// them in `AnyVolume`. Floating kinds instantiate the generic kernels;
/// integer kinds and mixed kinds are rejected before any work is done.

use crate::backward::correlation_backward_in;
use crate::error::CorrelationError;
use crate::forward::correlation_forward_in;
use crate::geometry::CorrelationConfig;
use crate::parallel::ParallelConfig;
use crate::tensor::{DType, Volume};

/// A volume of any supported storage kind.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyVolume {
    F32(Volume<f32>),
    F64(Volume<f64>),
    I32(Volume<i32>),
    I64(Volume<i64>),
}

impl AnyVolume {
    pub fn dtype(&self) -> DType {
        match self {
            AnyVolume::F32(_) => DType::F32,
            AnyVolume::F64(_) => DType::F64,
            AnyVolume::I32(_) => DType::I32,
            AnyVolume::I64(_) => DType::I64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            AnyVolume::F32(v) => v.shape(),
            AnyVolume::F64(v) => v.shape(),
            AnyVolume::I32(v) => v.shape(),
            AnyVolume::I64(v) => v.shape(),
        }
    }
}

macro_rules! impl_from_volume {
    ($($t:ty => $variant:ident),*) => {
        $(impl From<Volume<$t>> for AnyVolume {
            fn from(v: Volume<$t>) -> Self {
                AnyVolume::$variant(v)
            }
        })*
    };
}

impl_from_volume!(f32 => F32, f64 => F64, i32 => I32, i64 => I64);

/// Error for a combination of kinds no kernel is instantiated for. An
/// integer kind is reported ahead of a float mismatch, scanning left to right.
fn rejection(volumes: &[&AnyVolume]) -> CorrelationError {
    let mut kinds = volumes.iter().map(|v| v.dtype());
    if let Some(bad) = kinds.clone().find(|d| !d.is_float()) {
        return CorrelationError::UnsupportedDType(bad);
    }
    let left = kinds.next().unwrap_or(DType::F32);
    let right = kinds.find(|&d| d != left).unwrap_or(left);
    CorrelationError::DTypeMismatch { left, right }
}

/// Forward correlation on runtime-typed volumes, global pool.
pub fn correlation_forward_dispatch(
    input1: &AnyVolume,
    input2: &AnyVolume,
    cfg: &CorrelationConfig,
) -> Result<AnyVolume, CorrelationError> {
    correlation_forward_dispatch_in(&ParallelConfig::default(), input1, input2, cfg)
}

pub fn correlation_forward_dispatch_in(
    par: &ParallelConfig,
    input1: &AnyVolume,
    input2: &AnyVolume,
    cfg: &CorrelationConfig,
) -> Result<AnyVolume, CorrelationError> {
    match (input1, input2) {
        (AnyVolume::F32(a), AnyVolume::F32(b)) => Ok(correlation_forward_in(par, a, b, cfg)?.into()),
        (AnyVolume::F64(a), AnyVolume::F64(b)) => Ok(correlation_forward_in(par, a, b, cfg)?.into()),
        _ => Err(rejection(&[input1, input2])),
    }
}

/// Backward correlation on runtime-typed volumes. `grad_output` must share
/// the inputs' element kind.
pub fn correlation_backward_dispatch(
    input1: &AnyVolume,
    input2: &AnyVolume,
    grad_output: &AnyVolume,
    cfg: &CorrelationConfig,
) -> Result<(AnyVolume, AnyVolume), CorrelationError> {
    correlation_backward_dispatch_in(&ParallelConfig::default(), input1, input2, grad_output, cfg)
}

pub fn correlation_backward_dispatch_in(
    par: &ParallelConfig,
    input1: &AnyVolume,
    input2: &AnyVolume,
    grad_output: &AnyVolume,
    cfg: &CorrelationConfig,
) -> Result<(AnyVolume, AnyVolume), CorrelationError> {
    match (input1, input2, grad_output) {
        (AnyVolume::F32(a), AnyVolume::F32(b), AnyVolume::F32(g)) => {
            let (g1, g2) = correlation_backward_in(par, a, b, g, cfg)?;
            Ok((g1.into(), g2.into()))
        }
        (AnyVolume::F64(a), AnyVolume::F64(b), AnyVolume::F64(g)) => {
            let (g1, g2) = correlation_backward_in(par, a, b, g, cfg)?;
            Ok((g1.into(), g2.into()))
        }
        _ => Err(rejection(&[input1, input2, grad_output])),
    }
}
