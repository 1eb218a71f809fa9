//! Runtime assembly.
//!
//! [`Runtime::start`] wires the cache, scheduler, admission controller and
//! worker pool together and spawns three kinds of task:
//! - the dispatcher: forms batches, pins their sequences and hands them to
//!   the least loaded worker; applies budget tuning and publishes telemetry
//!   from batch reports
//! - the maintenance task: periodic defragmentation
//! - one task per worker
//!
//! Callers interact through a cloneable [`RuntimeHandle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionError, AdmissionStats, RequestOutcome, StepProgress};
use crate::cache::manager::{CacheError, CacheStats, KvCacheManager};
use crate::config::{Config, ConfigError};
use crate::scheduler::batch::{step_cost, Batch, Scheduler};
use crate::scheduler::tuning::{self, TuningSample, TuningState};
use crate::sequence::{Request, RequestId, SequenceState};
use crate::telemetry::{emit, event_channel, EventSender, SequenceEvent, TelemetrySink, TelemetrySnapshot};
use crate::worker::backend::InferenceBackend;
use crate::worker::deque::WorkQueues;
use crate::worker::pool::{self, BatchReport, WorkerContext};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A submitted request and its pending outcome.
pub struct Submission {
    pub id: RequestId,
    outcome: oneshot::Receiver<RequestOutcome>,
    /// Per-step progress for streaming requests.
    pub progress: Option<mpsc::UnboundedReceiver<StepProgress>>,
}

impl Submission {
    /// Wait for the terminal outcome.
    pub async fn wait(self) -> RequestOutcome {
        self.outcome.await.unwrap_or_else(|_| RequestOutcome::Failed {
            reason: "runtime dropped the request".to_string(),
        })
    }
}

/// Runtime-wide statistics for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub runtime_id: String,
    pub uptime_secs: f64,
    pub queue_depth: usize,
    pub token_budget: usize,
    pub batches: u64,
    pub worker_queues: Vec<usize>,
    pub admission: AdmissionStats,
    pub cache: CacheStats,
}

struct Shared {
    id: Uuid,
    config: Config,
    cache: Arc<KvCacheManager>,
    admission: Arc<AdmissionController>,
    queues: Arc<WorkQueues>,
    events: EventSender,
    tuning: Mutex<TuningState>,
    batches: AtomicU64,
    queue_ready: Notify,
    started: Instant,
}

/// Cloneable handle to a running runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<Shared>,
}

impl RuntimeHandle {
    /// Admit a request. Fails fast with a typed, possibly retryable error.
    pub fn submit(&self, request: Request) -> Result<Submission, AdmissionError> {
        let admission = &self.shared.admission;
        let admitted = pool::without_stalling(&self.shared.cache, || admission.admit_with_outcome(request))?;
        self.shared.queue_ready.notify_one();
        Ok(Submission {
            id: admitted.id,
            outcome: admitted.outcome,
            progress: admitted.progress,
        })
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        self.shared.admission.cancel(id)
    }

    /// Subscribe to per-sequence state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.shared.events.subscribe()
    }

    pub fn state_of(&self, id: RequestId) -> Option<SequenceState> {
        self.shared.admission.state_of(id)
    }

    pub fn token_budget(&self) -> usize {
        self.shared.lock_tuning().token_budget
    }

    pub fn stats(&self) -> RuntimeStats {
        let s = &self.shared;
        RuntimeStats {
            runtime_id: s.id.to_string(),
            uptime_secs: s.started.elapsed().as_secs_f64(),
            queue_depth: s.admission.queue_depth(),
            token_budget: self.token_budget(),
            batches: s.batches.load(Ordering::Relaxed),
            worker_queues: s.queues.lengths(),
            admission: s.admission.stats(),
            cache: s.cache.stats(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn cache(&self) -> &Arc<KvCacheManager> {
        &self.shared.cache
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.shared.admission
    }
}

/// A running scheduler instance.
pub struct Runtime {
    handle: RuntimeHandle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Validate the configuration and spawn all tasks. Must be called inside
    /// a tokio runtime.
    pub fn start(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        if config.cache.acquire.timeout().is_some() && !pool::runs_multi_thread() {
            warn!("Blocking page acquisition on a current-thread runtime stalls every task while it waits");
        }

        let id = Uuid::new_v4();
        let cache = Arc::new(KvCacheManager::new(&config.cache, &config.model));
        let scheduler = Arc::new(Mutex::new(Scheduler::new(&config.scheduler)));
        let events = event_channel(config.admission.event_capacity);
        let admission = Arc::new(AdmissionController::new(
            &config,
            Arc::clone(&cache),
            scheduler,
            events.clone(),
        ));
        let queues = Arc::new(WorkQueues::new(config.workers.workers));
        let work_ready = Arc::new(Notify::new());
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let execute_timeout = Duration::from_millis(config.workers.execute_timeout_ms);
        let tick = Duration::from_millis(config.scheduler.tick_ms.max(1));
        let ctx = Arc::new(WorkerContext {
            cache: Arc::clone(&cache),
            admission: Arc::clone(&admission),
            backend,
            queues: Arc::clone(&queues),
            work_ready: Arc::clone(&work_ready),
            reports: report_tx,
            execute_timeout,
            idle_poll: tick * 10,
        });
        pool::log_layout(&queues, execute_timeout);

        let shared = Arc::new(Shared {
            id,
            tuning: Mutex::new(TuningState::new(config.scheduler.token_budget)),
            config,
            cache,
            admission,
            queues,
            events,
            batches: AtomicU64::new(0),
            queue_ready: Notify::new(),
            started: Instant::now(),
        });

        let span = info_span!("runtime", id = %id);
        let mut tasks = pool::spawn_workers(ctx, shutdown_rx.clone(), span.clone());
        tasks.push(tokio::spawn(
            dispatch_loop(Arc::clone(&shared), work_ready, report_rx, sink, shutdown_rx.clone())
                .instrument(span.clone()),
        ));
        tasks.push(tokio::spawn(
            maintenance_loop(Arc::clone(&shared), shutdown_rx).instrument(span),
        ));

        info!(
            runtime_id = %id,
            workers = shared.config.workers.workers,
            capacity_pages = shared.config.cache.capacity_pages,
            page_tokens = shared.config.cache.page_tokens,
            token_budget = shared.config.scheduler.token_budget,
            "Runtime started"
        );

        Ok(Self {
            handle: RuntimeHandle { shared },
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Stop all tasks, then fail whatever was still queued or in flight.
    pub async fn shutdown(self) {
        let shared = Arc::clone(&self.handle.shared);
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Runtime task ended abnormally");
            }
        }

        for batch in shared.queues.drain() {
            for entry in batch.entries {
                let id = entry.id();
                shared.admission.finish(
                    id,
                    RequestOutcome::Failed {
                        reason: "runtime shut down".to_string(),
                    },
                );
                shared.cache.unpin(id);
            }
        }
        shared.admission.close("runtime shut down");
        info!(runtime_id = %shared.id, "Runtime stopped");
    }
}

impl Shared {
    fn lock_tuning(&self) -> std::sync::MutexGuard<'_, TuningState> {
        self.tuning.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// One scheduling round. Returns true if a batch was handed to a worker.
    fn dispatch_round(&self, work_ready: &Notify) -> bool {
        let token_budget = self.lock_tuning().token_budget;
        let configured = self.config.scheduler.memory_budget_pages;
        let memory_budget = configured.min(self.cache.pool().available());
        let decode_chunk = self.config.scheduler.decode_chunk;
        let page_tokens = self.config.cache.page_tokens;

        let mut cancelled = Vec::new();
        let mut failed = Vec::new();

        // Pins are taken before the scheduler lock is released so nothing in
        // the batch can be evicted on its way to a worker.
        let mut sched = self.admission.lock_scheduler();
        if sched.is_empty() {
            return false;
        }
        let cache = &self.cache;
        let outcome = sched.form_batch(token_budget, memory_budget, |e| {
            step_cost(e, decode_chunk, page_tokens, cache.page_count(e.id).unwrap_or(0))
        });

        for boost in &outcome.boosted {
            emit(
                &self.events,
                SequenceEvent::StarvationGuardTriggered {
                    id: boost.id,
                    from: boost.from,
                    to: boost.to,
                },
            );
        }

        let mut batch = outcome.batch;
        let mut entries = Vec::with_capacity(batch.len());
        for entry in std::mem::take(&mut batch.entries) {
            let id = entry.id();
            if self.admission.is_cancel_requested(id) {
                cancelled.push(id);
                continue;
            }
            match self.cache.pin(id) {
                Ok(()) => entries.push(entry),
                Err(CacheError::Evicted(_)) => {
                    self.admission.settle_eviction(id, Some(entry.queued), &mut sched)
                }
                Err(e) => failed.push((id, e.to_string())),
            }
        }
        drop(sched);

        for entry in outcome.expired {
            self.admission.finish(entry.id, RequestOutcome::Expired);
        }
        for id in cancelled {
            self.admission.finish(id, RequestOutcome::Cancelled);
        }
        for (id, reason) in failed {
            self.admission.finish(id, RequestOutcome::Failed { reason });
        }

        if outcome.memory_pressure && memory_budget < configured {
            self.admission.on_memory_pressure();
        }
        if entries.is_empty() {
            return false;
        }
        self.admission.relieve_pressure();

        let batch = Batch { entries, ..batch };
        self.admission
            .mark(&batch.sequence_ids(), SequenceState::Batched, batch.id);
        let worker = self.queues.least_loaded();
        debug!(
            batch = batch.id,
            worker,
            size = batch.len(),
            tokens = batch.token_cost,
            "Dispatching batch"
        );
        self.queues.push(worker, batch);
        self.batches.fetch_add(1, Ordering::Relaxed);
        work_ready.notify_one();
        true
    }

    fn on_report(&self, report: &BatchReport, sink: &dyn TelemetrySink) {
        let sample = TuningSample {
            latency_ms: report.latency.as_secs_f64() * 1000.0,
            tokens: report.tokens,
        };
        let token_budget = {
            let mut state = self.lock_tuning();
            let next = tuning::step(*state, sample, &self.config.scheduler.tuning);
            if next.token_budget != state.token_budget {
                debug!(
                    from = state.token_budget,
                    to = next.token_budget,
                    ewma_ms = next.ewma_latency_ms.unwrap_or_default(),
                    "Token budget adjusted"
                );
            }
            *state = next;
            next.token_budget
        };

        let stats = self.cache.stats();
        sink.record(&TelemetrySnapshot {
            queue_depth: self.admission.queue_depth(),
            pages_in_use: stats.pages_in_use,
            capacity_pages: stats.capacity_pages,
            page_utilization: stats.utilization,
            evictions_total: stats.evictions,
            batch_size: report.size,
            batch_tokens: report.tokens,
            batch_latency: report.latency,
            completed: report.completed,
            failed: report.failed,
            token_budget,
        });
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    work_ready: Arc<Notify>,
    mut reports: mpsc::UnboundedReceiver<BatchReport>,
    sink: Arc<dyn TelemetrySink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tick = Duration::from_millis(shared.config.scheduler.tick_ms.max(1));
    let max_queued = shared.config.workers.workers * shared.config.workers.local_queue_depth;

    loop {
        if *shutdown.borrow() {
            break;
        }
        while let Ok(report) = reports.try_recv() {
            shared.on_report(&report, sink.as_ref());
        }
        if shared.queues.total() < max_queued && shared.dispatch_round(&work_ready) {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(report) = reports.recv() => shared.on_report(&report, sink.as_ref()),
            _ = shared.queue_ready.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }
    debug!("Dispatcher stopped");
}

async fn maintenance_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(shared.config.cache.defrag_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let report = shared.cache.defragment();
                if report.ran {
                    debug!(
                        relocated = report.relocated,
                        skipped = report.skipped_sequences,
                        "Maintenance defragmentation"
                    );
                }
            }
        }
    }
}
