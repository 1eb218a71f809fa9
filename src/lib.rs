//! kv-cache-sched: admission-controlled scheduling over a paged, quantized
//! KV cache for local LLM inference.
//!
//! Requests enter through the [`admission`] controller, wait in the
//! [`scheduler`]'s priority queue, are grouped into budgeted batches and run
//! on the [`worker`] pool. Their key/value state lives in fixed-size pages of
//! the [`cache`], stored as 8-bit codes and evicted LRU-first under pressure.
//! [`runtime`] ties it all together behind one handle.

pub mod admission;
pub mod cache;
pub mod config;
pub mod runtime;
pub mod scheduler;
pub mod sequence;
pub mod server;
pub mod telemetry;
pub mod worker;
