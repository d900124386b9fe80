/// Parallel execution settings for the correlation passes.
///
/// The forward pass always partitions its output into disjoint
/// (batch, pH, pW) blocks, so it needs no strategy. The backward pass is a
/// scatter-add into shared gradient buffers and must pick one of the
/// strategies below; all of them produce the same gradients up to float
/// summation order.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::CorrelationError;

/// How the backward pass splits work across rayon workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackwardStrategy {
    /// One worker per batch sample. Each sample owns disjoint gradient slices,
    /// so displacements and output cells run sequentially inside the worker.
    #[default]
    BatchParallel,
    /// Workers split (batch, displacement) pairs and accumulate into private
    /// full-size gradient buffers that are summed once every worker finishes.
    /// Scales past the batch size at the cost of one buffer pair per split.
    PrivateReduce,
    /// Single thread. Same visiting order as one BatchParallel worker.
    Sequential,
}

/// Execution settings shared by forward and backward.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub backward: BackwardStrategy,
    /// Size of a dedicated thread pool. None runs on rayon's global pool.
    pub num_threads: Option<usize>,
}

impl ParallelConfig {
    pub fn batch_parallel() -> Self {
        ParallelConfig { backward: BackwardStrategy::BatchParallel, num_threads: None }
    }

    pub fn private_reduce() -> Self {
        ParallelConfig { backward: BackwardStrategy::PrivateReduce, num_threads: None }
    }

    pub fn sequential() -> Self {
        ParallelConfig { backward: BackwardStrategy::Sequential, num_threads: None }
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, CorrelationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, CorrelationError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Run `f` on the configured pool. Fails before running `f` if the pool
    /// cannot be built.
    pub fn install<R, F>(&self, f: F) -> Result<R, CorrelationError>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self.num_threads {
            None => Ok(f()),
            Some(0) => Err(CorrelationError::Config("num_threads must be >= 1".to_string())),
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("corrvol-{i}"))
                    .build()?;
                trace!(num_threads = n, "running on dedicated pool");
                Ok(pool.install(f))
            }
        }
    }
}
