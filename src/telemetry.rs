//! Telemetry and state-transition events.
//!
//! Two outbound channels:
//! - [`TelemetrySink`]: one [`TelemetrySnapshot`] per batch cycle. Sinks must
//!   not block; [`PrometheusSink`] only touches atomics.
//! - [`SequenceEvent`]s on a tokio broadcast channel. Sending never blocks;
//!   slow receivers observe `Lagged` and skip ahead.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::scheduler::batch::BatchId;
use crate::sequence::{Priority, RequestId};

/// Metrics emitted once per batch cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub queue_depth: usize,
    pub pages_in_use: usize,
    pub capacity_pages: usize,
    pub page_utilization: f64,
    /// Cumulative evictions since start.
    pub evictions_total: u64,
    pub batch_size: usize,
    pub batch_tokens: usize,
    pub batch_latency: Duration,
    /// Sequences that finished in this cycle.
    pub completed: usize,
    /// Sequences that failed in this cycle.
    pub failed: usize,
    pub token_budget: usize,
}

/// Receiver of per-cycle telemetry.
pub trait TelemetrySink: Send + Sync {
    /// Record a snapshot. Must return promptly.
    fn record(&self, snapshot: &TelemetrySnapshot);
}

/// Discards everything.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _snapshot: &TelemetrySnapshot) {}
}

/// Prometheus-backed sink with its own registry.
pub struct PrometheusSink {
    registry: Registry,
    queue_depth: IntGauge,
    pages_in_use: IntGauge,
    page_utilization: Gauge,
    token_budget: IntGauge,
    evictions: IntCounter,
    batches: IntCounter,
    completed: IntCounter,
    failed: IntCounter,
    batch_latency: Histogram,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queue_depth = IntGauge::new("kvsched_queue_depth", "Requests waiting in the priority queue")?;
        let pages_in_use = IntGauge::new("kvsched_pages_in_use", "KV cache pages owned by sequences")?;
        let page_utilization = Gauge::new("kvsched_page_utilization", "Fraction of KV cache pages in use")?;
        let token_budget = IntGauge::new("kvsched_token_budget", "Current per-batch token budget")?;
        let evictions = IntCounter::new("kvsched_evictions_total", "Sequences evicted from the KV cache")?;
        let batches = IntCounter::new("kvsched_batches_total", "Batches executed")?;
        let completed = IntCounter::new("kvsched_sequences_completed_total", "Sequences completed")?;
        let failed = IntCounter::new("kvsched_sequences_failed_total", "Sequences failed")?;
        let batch_latency = Histogram::with_opts(
            HistogramOpts::new("kvsched_batch_latency_seconds", "Batch execution latency").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(pages_in_use.clone()))?;
        registry.register(Box::new(page_utilization.clone()))?;
        registry.register(Box::new(token_budget.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(batches.clone()))?;
        registry.register(Box::new(completed.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(batch_latency.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            pages_in_use,
            page_utilization,
            token_budget,
            evictions,
            batches,
            completed,
            failed,
            batch_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl TelemetrySink for PrometheusSink {
    fn record(&self, s: &TelemetrySnapshot) {
        self.queue_depth.set(s.queue_depth as i64);
        self.pages_in_use.set(s.pages_in_use as i64);
        self.page_utilization.set(s.page_utilization);
        self.token_budget.set(s.token_budget as i64);

        let seen = self.evictions.get();
        if s.evictions_total > seen {
            self.evictions.inc_by(s.evictions_total - seen);
        }
        if s.batch_size > 0 {
            self.batches.inc();
            self.batch_latency.observe(s.batch_latency.as_secs_f64());
        }
        self.completed.inc_by(s.completed as u64);
        self.failed.inc_by(s.failed as u64);
    }
}

/// Per-sequence state transitions, for the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    Queued { id: RequestId, priority: Priority },
    Batched { id: RequestId, batch: BatchId },
    Running { id: RequestId, batch: BatchId },
    /// Multi-step request returned to the queue between steps.
    Requeued { id: RequestId, generated: usize },
    Completed { id: RequestId, tokens: usize },
    Evicted { id: RequestId, recompute: bool },
    Failed { id: RequestId, reason: String },
    Cancelled { id: RequestId },
    /// Informational: deferrals raised the request's effective tier.
    StarvationGuardTriggered { id: RequestId, from: Priority, to: Priority },
}

impl SequenceEvent {
    pub fn id(&self) -> RequestId {
        match self {
            SequenceEvent::Queued { id, .. }
            | SequenceEvent::Batched { id, .. }
            | SequenceEvent::Running { id, .. }
            | SequenceEvent::Requeued { id, .. }
            | SequenceEvent::Completed { id, .. }
            | SequenceEvent::Evicted { id, .. }
            | SequenceEvent::Failed { id, .. }
            | SequenceEvent::Cancelled { id }
            | SequenceEvent::StarvationGuardTriggered { id, .. } => *id,
        }
    }
}

/// Shared broadcast channel for sequence events.
pub type EventSender = Arc<broadcast::Sender<SequenceEvent>>;

pub fn event_channel(capacity: usize) -> EventSender {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Arc::new(tx)
}

/// Publish an event. Having no subscribers is not an error.
pub fn emit(events: &EventSender, event: SequenceEvent) {
    let _ = events.send(event);
}
