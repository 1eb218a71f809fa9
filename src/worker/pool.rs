//! Worker pool.
//!
//! Each worker loops: own deque first, then steal, then park until the
//! dispatcher signals new work (or the idle poll fires). A batch is one
//! backend call wrapped in a timeout and a panic guard; any backend fault
//! fails every sequence of that batch and nothing else.
//!
//! After a successful step each sequence's KV output is appended to the
//! cache (a prefill's prompt KV is also offered to the prompt cache and a
//! streaming submitter hears about new tokens), then the sequence is
//! completed, cancelled or put back on the queue for its next step. Pins are dropped only after that, so an unfinished
//! sequence is never evictable while it is between the worker and the queue.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::admission::{AdmissionController, RequestOutcome};
use crate::cache::manager::{CacheError, KvCacheManager};
use crate::scheduler::batch::{Batch, BatchEntry, BatchId, StepKind};
use crate::scheduler::queue::QueuedRequest;
use crate::sequence::{RequestId, SequenceState};
use crate::worker::backend::{InferenceBackend, SequenceOutput};
use crate::worker::deque::WorkQueues;

/// Result of one batch, sent back to the dispatcher.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub worker: usize,
    pub size: usize,
    pub tokens: usize,
    pub latency: Duration,
    pub completed: usize,
    pub failed: usize,
}

/// Everything a worker needs, shared by all workers.
pub struct WorkerContext {
    pub cache: Arc<KvCacheManager>,
    pub admission: Arc<AdmissionController>,
    pub backend: Arc<dyn InferenceBackend>,
    pub queues: Arc<WorkQueues>,
    pub work_ready: Arc<Notify>,
    pub reports: mpsc::UnboundedSender<BatchReport>,
    pub execute_timeout: Duration,
    pub idle_poll: Duration,
}

/// What became of one sequence after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Requeued,
    Completed,
    Cancelled,
    Failed,
}

/// Spawn one task per worker deque, inside `span`.
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    shutdown: watch::Receiver<bool>,
    span: Span,
) -> Vec<JoinHandle<()>> {
    (0..ctx.queues.workers())
        .map(|id| {
            tokio::spawn(worker_loop(id, Arc::clone(&ctx), shutdown.clone()).instrument(span.clone()))
        })
        .collect()
}

async fn worker_loop(id: usize, ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Some(batch) = ctx.queues.next_for(id) {
            let report = run_batch(id, &ctx, batch).await;
            let _ = ctx.reports.send(report);
            continue;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ctx.work_ready.notified() => {}
            _ = tokio::time::sleep(ctx.idle_poll) => {}
        }
    }
    debug!(worker = id, "Worker stopped");
}

/// Execute one batch and settle every sequence in it.
pub async fn run_batch(worker: usize, ctx: &WorkerContext, batch: Batch) -> BatchReport {
    let started = Instant::now();
    let ids = batch.sequence_ids();
    ctx.admission.mark(&ids, SequenceState::Running, batch.id);

    let call = AssertUnwindSafe(ctx.backend.execute(&batch)).catch_unwind();
    let result = match tokio::time::timeout(ctx.execute_timeout, call).await {
        Ok(Ok(Ok(outputs))) => Ok(outputs),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(panic)) => Err(format!("backend panicked: {}", panic_message(panic.as_ref()))),
        Err(_) => Err(format!("backend timed out after {:?}", ctx.execute_timeout)),
    };

    let mut report = BatchReport {
        batch_id: batch.id,
        worker,
        size: batch.len(),
        tokens: batch.token_cost,
        latency: Duration::ZERO,
        completed: 0,
        failed: 0,
    };

    match result {
        Err(reason) => {
            error!(worker, batch = batch.id, size = batch.len(), reason = %reason, "Batch failed");
            for entry in batch.entries {
                let id = entry.id();
                ctx.admission.finish(id, RequestOutcome::Failed { reason: reason.clone() });
                ctx.cache.unpin(id);
                report.failed += 1;
            }
        }
        Ok(outputs) => {
            let mut by_id: HashMap<RequestId, SequenceOutput> =
                outputs.into_iter().map(|o| (o.sequence_id, o)).collect();
            without_stalling(&ctx.cache, || {
                for entry in batch.entries {
                    let id = entry.id();
                    let settled = match by_id.remove(&id) {
                        Some(output) => settle(ctx, entry, output),
                        None => fail(ctx, id, "backend returned no output for sequence".to_string()),
                    };
                    ctx.cache.unpin(id);
                    match settled {
                        Settled::Completed => report.completed += 1,
                        Settled::Failed => report.failed += 1,
                        Settled::Requeued | Settled::Cancelled => {}
                    }
                }
            });
        }
    }

    // Appends may have evicted idle sequences.
    ctx.admission.reconcile_evictions();

    report.latency = started.elapsed();
    debug!(
        worker,
        batch = report.batch_id,
        size = report.size,
        latency_ms = report.latency.as_millis() as u64,
        completed = report.completed,
        failed = report.failed,
        "Batch done"
    );
    report
}

/// Run cache work that may wait on the page pool. In blocking acquire mode on
/// a multi-threaded runtime the wait is moved off the executor, so timers and
/// the tasks that release pages keep running.
pub fn without_stalling<T>(cache: &KvCacheManager, work: impl FnOnce() -> T) -> T {
    if cache.pool().blocks() && runs_multi_thread() {
        tokio::task::block_in_place(work)
    } else {
        work()
    }
}

pub(crate) fn runs_multi_thread() -> bool {
    Handle::try_current()
        .map(|h| h.runtime_flavor() == RuntimeFlavor::MultiThread)
        .unwrap_or(false)
}

fn settle(ctx: &WorkerContext, entry: BatchEntry, output: SequenceOutput) -> Settled {
    let id = entry.id();
    let dim = ctx.cache.dim();
    let kv_tokens = output.kv.token_count(dim);
    if kv_tokens != entry.step.tokens {
        return fail(
            ctx,
            id,
            format!(
                "backend returned KV for {kv_tokens} tokens, step processed {}",
                entry.step.tokens
            ),
        );
    }

    match ctx.cache.append(id, &output.kv.keys, &output.kv.values) {
        Ok(()) => {}
        Err(CacheError::OutOfMemory { needed, .. }) => {
            // No progress is recorded; the step reruns once pages free up.
            warn!(sequence = %id, needed, "No pages for step output, requeueing");
            ctx.admission.raise_backpressure();
            return requeue(ctx, entry.queued);
        }
        Err(e) => return fail(ctx, id, e.to_string()),
    }
    if entry.step.kind == StepKind::Prefill {
        ctx.admission.remember_prompt(&entry.queued);
    }

    let mut queued = entry.queued;
    queued.prefilled = true;
    queued.generated += output.generated;
    ctx.admission.report_progress(id, output.generated, queued.generated);

    if ctx.admission.is_cancel_requested(id) {
        ctx.admission.finish(id, RequestOutcome::Cancelled);
        Settled::Cancelled
    } else if output.finished || queued.is_finished() {
        ctx.admission.finish(
            id,
            RequestOutcome::Completed {
                tokens: queued.generated,
            },
        );
        Settled::Completed
    } else {
        requeue(ctx, queued)
    }
}

fn requeue(ctx: &WorkerContext, queued: QueuedRequest) -> Settled {
    let id = queued.id;
    match ctx.admission.requeue(queued) {
        Ok(()) => Settled::Requeued,
        Err(e) => fail(ctx, id, e.to_string()),
    }
}

fn fail(ctx: &WorkerContext, id: RequestId, reason: String) -> Settled {
    ctx.admission.finish(id, RequestOutcome::Failed { reason });
    Settled::Failed
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Log the pool layout once at startup.
pub fn log_layout(queues: &WorkQueues, execute_timeout: Duration) {
    info!(
        workers = queues.workers(),
        execute_timeout_ms = execute_timeout.as_millis() as u64,
        "Worker pool ready"
    );
}
