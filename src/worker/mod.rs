//! Batch execution.
//!
//! - [`backend`]: the inference backend seam and a synthetic backend
//! - [`deque`]: per-worker deques with tail stealing
//! - [`pool`]: worker tasks, batch execution and fault isolation

pub mod backend;
pub mod deque;
pub mod pool;

pub use backend::{BackendError, InferenceBackend, SequenceOutput, SyntheticBackend};
pub use deque::WorkQueues;
pub use pool::{BatchReport, WorkerContext};
