pub mod error;
pub mod tensor;
pub mod geometry;
pub mod kernel;
pub mod forward;
pub mod backward;
pub mod parallel;
pub mod dispatch;
pub mod tape;
pub mod opaque_adapters;

pub use backward::{correlation_backward, correlation_backward_in};
pub use dispatch::{
    correlation_backward_dispatch, correlation_backward_dispatch_in,
    correlation_forward_dispatch, correlation_forward_dispatch_in, AnyVolume,
};
pub use error::CorrelationError;
pub use forward::{correlation_forward, correlation_forward_in};
pub use geometry::{CorrelationConfig, Geometry};
pub use opaque_adapters::{record_correlation, register_opaque_vjps};
pub use parallel::{BackwardStrategy, ParallelConfig};
pub use tensor::{DType, Element, SimpleRng, Volume};
