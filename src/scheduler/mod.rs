//! Request scheduling.
//!
//! - [`queue`]: Priority queue ordered by (tier, arrival) with lazy deletion
//! - [`fairness`]: Per-tier starvation guard
//! - [`batch`]: Batch former with deferral boosts
//! - [`tuning`]: Latency-driven token budget tuner

pub mod batch;
pub mod fairness;
pub mod queue;
pub mod tuning;

pub use batch::{Batch, BatchEntry, BatchOutcome, Scheduler, StepCost, StepKind};
pub use queue::{PriorityQueue, QueueError, QueuedRequest};
