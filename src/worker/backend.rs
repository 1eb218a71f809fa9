//! Inference backend seam.
//!
//! The numerical backend is an external collaborator. The worker pool only
//! needs per-sequence output for one step: how many tokens were produced,
//! the key/value vectors to append to the cache, and whether the sequence is
//! done.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::page::KvVectors;
use crate::scheduler::batch::{Batch, BatchEntry, StepKind};
use crate::sequence::RequestId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend execution failed: {0}")]
    Execution(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Output of one sequence for one step.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    pub sequence_id: RequestId,
    /// New tokens generated in this step (0 for prefill).
    pub generated: usize,
    /// KV vectors for every token processed in this step.
    pub kv: KvVectors,
    /// The backend hit a stop condition.
    pub finished: bool,
}

/// The external inference backend.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Execute one step for every sequence in the batch.
    async fn execute(&self, batch: &Batch) -> Result<Vec<SequenceOutput>, BackendError>;
}

/// Deterministic stand-in backend.
///
/// Emits smooth, bounded KV data derived from the sequence id and token
/// position, and never stops early.
pub struct SyntheticBackend {
    dim: usize,
    delay: Duration,
}

impl SyntheticBackend {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            delay: Duration::ZERO,
        }
    }

    /// Simulated compute time per batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// KV vectors for `tokens` tokens starting at `position`.
    pub fn kv_for(&self, id: RequestId, position: usize, tokens: usize) -> KvVectors {
        let mut kv = KvVectors::with_capacity(tokens * self.dim);
        let seed = id.0 as f32 * 0.37;
        for t in position..position + tokens {
            for j in 0..self.dim {
                let x = seed + t as f32 * 0.01 + j as f32 * 0.1;
                kv.keys.push(x.sin());
                kv.values.push(x.cos() * 0.5);
            }
        }
        kv
    }

    fn output(&self, entry: &BatchEntry) -> SequenceOutput {
        let q = &entry.queued;
        let position = q.context_tokens();
        let generated = match entry.step.kind {
            StepKind::Prefill => 0,
            StepKind::Decode => entry.step.tokens,
        };
        SequenceOutput {
            sequence_id: q.id,
            generated,
            kv: self.kv_for(q.id, position, entry.step.tokens),
            finished: false,
        }
    }
}

#[async_trait]
impl InferenceBackend for SyntheticBackend {
    async fn execute(&self, batch: &Batch) -> Result<Vec<SequenceOutput>, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(batch.entries.iter().map(|e| self.output(e)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::batch::{step_cost, Scheduler};
    use crate::sequence::Request;

    #[tokio::test]
    async fn test_synthetic_output_shape() {
        let mut sched = Scheduler::new(&SchedulerConfig::default());
        sched.enqueue(RequestId(1), Request::generate(20, 4)).unwrap();
        let batch = sched
            .form_batch(1000, 1000, |e| step_cost(e, 16, 16, 0))
            .batch;

        let backend = SyntheticBackend::new(8);
        let out = backend.execute(&batch).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].generated, 0);
        assert_eq!(out[0].kv.token_count(8), 20);
        assert_eq!(out[0].kv.values.len(), 160);
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let backend = SyntheticBackend::new(4);
        assert_eq!(
            backend.kv_for(RequestId(3), 10, 5),
            backend.kv_for(RequestId(3), 10, 5)
        );
        assert_ne!(
            backend.kv_for(RequestId(3), 10, 5),
            backend.kv_for(RequestId(4), 10, 5)
        );
    }
}
