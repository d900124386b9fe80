/// Error taxonomy for the correlation entry points.
///
/// Every check runs before an output buffer is allocated, so an `Err` never
/// comes with partial results. Kernels themselves are infallible.

use thiserror::Error;

use crate::tensor::DType;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CorrelationError {
    /// Volume is neither [B, C, H, W] nor [B, C, H, W, D].
    #[error("unsupported volume rank {rank}: expected 4 (2D) or 5 (3D)")]
    UnsupportedRank { rank: usize },

    #[error("input rank mismatch: input1 has {left} dims, input2 has {right}")]
    RankMismatch { left: usize, right: usize },

    /// A channel or spatial extent is zero.
    #[error("volume {shape:?} has an empty channel or spatial axis")]
    EmptyVolume { shape: Vec<usize> },

    #[error("batch mismatch: input1 has {left}, input2 has {right}")]
    BatchMismatch { left: usize, right: usize },

    #[error("channel mismatch: input1 has {left}, input2 has {right}")]
    ChannelMismatch { left: usize, right: usize },

    /// Geometry vectors disagree with each other or with the volume rank.
    #[error("geometry `{param}` has {got} spatial axes, expected {expected}")]
    GeometryRank { param: &'static str, expected: usize, got: usize },

    #[error("invalid `{param}` on axis {axis}: {value}")]
    InvalidGeometry { param: &'static str, axis: usize, value: usize },

    #[error(
        "degenerate output on axis {axis}: input {input} + 2*{padding} is smaller than dilated kernel {dilated_kernel}"
    )]
    DegenerateOutput { axis: usize, input: usize, padding: usize, dilated_kernel: usize },

    /// A volume whose element count the library cannot hold.
    #[error("{what} shape {shape:?} is too large to allocate")]
    SizeOverflow { what: &'static str, shape: Vec<usize> },

    #[error("unsupported element type {0}: only floating-point volumes are correlated")]
    UnsupportedDType(DType),

    #[error("element type mismatch: {left} vs {right}")]
    DTypeMismatch { left: DType, right: DType },

    #[error("gradient shape {got:?} does not match cost volume shape {expected:?}")]
    GradShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("data length {len} does not match shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

impl From<serde_json::Error> for CorrelationError {
    fn from(err: serde_json::Error) -> Self {
        CorrelationError::Config(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for CorrelationError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        CorrelationError::ThreadPool(err.to_string())
    }
}
