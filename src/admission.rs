//! Admission controller: the single entry gate.
//!
//! Every request passes these checks, in order:
//! - `QueueOverflow` when the queue is at its configured ceiling (retryable)
//! - `Backpressure` while memory pressure is signalled (retryable)
//! - `ContextOverflow` / `TooLarge` when the request can never fit (structural)
//! - `OutOfMemory` when free plus evictable pages cannot hold the prompt (retryable)
//!
//! Admitted requests get their prompt pages reserved (evicting idle
//! sequences LRU-first if needed) and are queued. The controller also owns
//! the request records: terminal outcomes, cancellation flags, and what
//! happens to sequences that lost their pages to eviction.
//!
//! Requests that carry prompt token ids start from the longest prefix found
//! in the prompt cache, and their prompt KV is offered back to it once
//! prefill has run.
//!
//! Streaming requests additionally get a progress channel that receives one
//! [`StepProgress`] per step that produced tokens, and a restart marker when
//! eviction sends the request back to recompute.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::manager::{CacheError, KvCacheManager};
use crate::cache::prompt_cache::{PromptCache, PromptCacheStats};
use crate::config::{AdmissionConfig, Config, EvictionPolicy};
use crate::scheduler::batch::{BatchId, Scheduler};
use crate::scheduler::queue::{QueueError, QueuedRequest};
use crate::sequence::{pages_for_tokens, Request, RequestId, SequenceState};
use crate::telemetry::{emit, EventSender, SequenceEvent};

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Queue overflow: {depth} requests queued (limit {limit}), retry later")]
    QueueOverflow { depth: usize, limit: usize },

    #[error("Backpressure: KV cache under memory pressure, retry later")]
    Backpressure,

    #[error("Request of {tokens} tokens exceeds the context window of {window}")]
    ContextOverflow { tokens: usize, window: usize },

    #[error("Request needs {pages} pages but the pool only has {capacity}")]
    TooLarge { pages: usize, capacity: usize },

    #[error("Request has an empty prompt")]
    EmptyPrompt,

    #[error("Request carries {ids} prompt ids for {tokens} prompt tokens")]
    PromptIdsMismatch { ids: usize, tokens: usize },

    #[error("Out of memory: {needed} pages needed, {reachable} free or evictable, retry later")]
    OutOfMemory { needed: usize, reachable: usize },

    #[error("Runtime is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl AdmissionError {
    /// Whether the caller should retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::QueueOverflow { .. }
                | AdmissionError::Backpressure
                | AdmissionError::OutOfMemory { .. }
        )
    }
}

/// Terminal outcome delivered to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed { tokens: usize },
    Failed { reason: String },
    Cancelled,
    Expired,
}

/// Progress of a streaming request after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    /// Tokens produced by this step.
    pub new_tokens: usize,
    /// Tokens produced so far.
    pub generated: usize,
    /// Earlier tokens were lost to eviction and will be produced again.
    pub restarted: bool,
}

/// What the submitter of an admitted request holds on to.
#[derive(Debug)]
pub struct Admitted {
    pub id: RequestId,
    pub outcome: oneshot::Receiver<RequestOutcome>,
    /// Present for streaming requests. Closes once the request is terminal.
    pub progress: Option<mpsc::UnboundedReceiver<StepProgress>>,
}

#[derive(Debug)]
struct RequestRecord {
    state: SequenceState,
    cancel_requested: bool,
    recomputes: u32,
    generated: usize,
    completion: Option<oneshot::Sender<RequestOutcome>>,
    progress: Option<mpsc::UnboundedSender<StepProgress>>,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected_overflow: AtomicU64,
    rejected_backpressure: AtomicU64,
    rejected_structural: AtomicU64,
    rejected_oom: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    recomputed: AtomicU64,
}

/// Admission counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub rejected_overflow: u64,
    pub rejected_backpressure: u64,
    pub rejected_structural: u64,
    pub rejected_oom: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub recomputed: u64,
    pub in_flight: usize,
    pub backpressure: bool,
    pub prompt_cache: PromptCacheStats,
}

/// The admission controller.
///
/// Lock order: scheduler before records; neither is held while waiting.
pub struct AdmissionController {
    config: AdmissionConfig,
    context_window: usize,
    page_tokens: usize,
    cache: Arc<KvCacheManager>,
    scheduler: Arc<Mutex<Scheduler>>,
    records: Mutex<HashMap<RequestId, RequestRecord>>,
    prompts: Mutex<PromptCache>,
    events: EventSender,
    pressure: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

impl AdmissionController {
    pub fn new(
        config: &Config,
        cache: Arc<KvCacheManager>,
        scheduler: Arc<Mutex<Scheduler>>,
        events: EventSender,
    ) -> Self {
        Self {
            config: config.admission.clone(),
            context_window: config.model.context_window,
            page_tokens: config.cache.page_tokens,
            cache,
            scheduler,
            records: Mutex::new(HashMap::new()),
            prompts: Mutex::new(PromptCache::new(
                config.admission.prompt_cache_entries,
                config.admission.prompt_cache_bytes,
            )),
            events,
            pressure: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub(crate) fn lock_scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<RequestId, RequestRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_prompts(&self) -> MutexGuard<'_, PromptCache> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit a request. Returns its id.
    pub fn admit(&self, request: Request) -> Result<RequestId, AdmissionError> {
        self.admit_with_outcome(request).map(|admitted| admitted.id)
    }

    /// Admit a request and get receivers for its terminal outcome and, when
    /// streaming, its per-step progress.
    pub fn admit_with_outcome(&self, request: Request) -> Result<Admitted, AdmissionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown);
        }

        let limit = self.config.max_queue_depth;
        let depth = self.lock_scheduler().len();
        if depth >= limit {
            self.counters.rejected_overflow.fetch_add(1, Ordering::Relaxed);
            debug!(depth, limit, "Rejecting request: queue overflow");
            return Err(AdmissionError::QueueOverflow { depth, limit });
        }
        if self.pressure.load(Ordering::Acquire) {
            self.counters.rejected_backpressure.fetch_add(1, Ordering::Relaxed);
            debug!("Rejecting request: backpressure");
            return Err(AdmissionError::Backpressure);
        }

        self.check_structure(&request).inspect_err(|_| {
            self.counters.rejected_structural.fetch_add(1, Ordering::Relaxed);
        })?;

        let needed = pages_for_tokens(request.prompt_tokens, self.page_tokens);
        let reachable = self.cache.pool().available() + self.cache.evictable_pages(None);
        if reachable < needed {
            self.counters.rejected_oom.fetch_add(1, Ordering::Relaxed);
            warn!(needed, reachable, "Rejecting request: out of memory");
            return Err(AdmissionError::OutOfMemory { needed, reachable });
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let priority = request.priority;
        self.cache.register(id, priority)?;
        if let Err(e) = self.cache.reserve(id, needed) {
            self.cache.release_sequence(id);
            self.reconcile_evictions();
            return Err(match e {
                CacheError::OutOfMemory { .. } => {
                    self.counters.rejected_oom.fetch_add(1, Ordering::Relaxed);
                    AdmissionError::OutOfMemory {
                        needed,
                        reachable: self.cache.pool().available(),
                    }
                }
                other => other.into(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let (progress_tx, progress_rx) = if request.streaming {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.lock_records().insert(
            id,
            RequestRecord {
                state: SequenceState::Queued,
                cancel_requested: false,
                recomputes: 0,
                generated: 0,
                completion: Some(tx),
                progress: progress_tx,
            },
        );

        let cached_prefix = self.restore_prefix(id, &request);
        let (prompt_tokens, max_tokens, streaming) = (request.prompt_tokens, request.max_tokens, request.streaming);
        let enqueued = {
            let mut sched = self.lock_scheduler();
            // Depth is rechecked under the lock so concurrent admits cannot
            // push the queue past its ceiling.
            let depth = sched.len();
            if depth >= limit {
                Err(AdmissionError::QueueOverflow { depth, limit })
            } else {
                sched
                    .enqueue_with_prefix(id, request, cached_prefix)
                    .map_err(AdmissionError::from)
            }
        };
        if let Err(e) = enqueued {
            self.lock_records().remove(&id);
            self.cache.release_sequence(id);
            if matches!(e, AdmissionError::QueueOverflow { .. }) {
                self.counters.rejected_overflow.fetch_add(1, Ordering::Relaxed);
            }
            return Err(e);
        }

        emit(&self.events, SequenceEvent::Queued { id, priority });
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        info!(
            request = %id,
            priority = %priority,
            prompt_tokens,
            max_tokens,
            streaming,
            cached_prefix,
            pages = needed,
            "Admitted request"
        );

        // Reserving may have evicted idle sequences.
        self.reconcile_evictions();
        Ok(Admitted {
            id,
            outcome: rx,
            progress: progress_rx,
        })
    }

    /// Copy the longest cached prefix of the prompt into the sequence's
    /// reserved pages. Returns how many prompt tokens it covers.
    fn restore_prefix(&self, id: RequestId, request: &Request) -> usize {
        let Some(ids) = &request.prompt_ids else {
            return 0;
        };
        let Some((found, mut kv)) = self.lock_prompts().find_prefix(ids) else {
            return 0;
        };
        // The last prompt token always runs so prefill yields its logits.
        let len = found.min(ids.len() - 1);
        if len == 0 {
            return 0;
        }
        let elements = len * self.cache.dim();
        kv.keys.truncate(elements);
        kv.values.truncate(elements);
        match self.cache.append(id, &kv.keys, &kv.values) {
            Ok(()) => {
                debug!(request = %id, tokens = len, "Restored prompt prefix");
                len
            }
            Err(e) => {
                warn!(request = %id, error = %e, "Prompt prefix restore failed, prefilling in full");
                0
            }
        }
    }

    /// Offer a prefilled prompt's KV to the prompt cache. Call after the
    /// prefill step was appended and before the request is finished.
    pub fn remember_prompt(&self, entry: &QueuedRequest) {
        let Some(ids) = &entry.request.prompt_ids else {
            return;
        };
        if self.config.prompt_cache_entries == 0 {
            return;
        }
        match self.cache.read(entry.id, 0..ids.len()) {
            Ok(kv) => self.lock_prompts().insert(ids, kv),
            Err(e) => debug!(request = %entry.id, error = %e, "Prompt KV not cached"),
        }
    }

    fn check_structure(&self, request: &Request) -> Result<(), AdmissionError> {
        if request.prompt_tokens == 0 {
            return Err(AdmissionError::EmptyPrompt);
        }
        if let Some(ids) = &request.prompt_ids {
            if ids.len() != request.prompt_tokens {
                return Err(AdmissionError::PromptIdsMismatch {
                    ids: ids.len(),
                    tokens: request.prompt_tokens,
                });
            }
        }
        let tokens = request.target_tokens();
        if tokens > self.context_window {
            return Err(AdmissionError::ContextOverflow {
                tokens,
                window: self.context_window,
            });
        }
        let pages = pages_for_tokens(tokens, self.page_tokens);
        let capacity = self.cache.pool().capacity();
        if pages > capacity {
            return Err(AdmissionError::TooLarge { pages, capacity });
        }
        Ok(())
    }

    /// Cancel a request. Queued requests are removed at once; running ones
    /// are flagged and stopped at the next batch boundary.
    pub fn cancel(&self, id: RequestId) -> bool {
        let queued = self.lock_scheduler().cancel(id);
        if queued.is_some() {
            return self.finish(id, RequestOutcome::Cancelled);
        }
        match self.lock_records().get_mut(&id) {
            Some(record) if !record.state.is_terminal() => {
                record.cancel_requested = true;
                debug!(request = %id, "Cancellation flagged for next batch boundary");
                true
            }
            _ => false,
        }
    }

    pub fn is_cancel_requested(&self, id: RequestId) -> bool {
        self.lock_records()
            .get(&id)
            .is_some_and(|r| r.cancel_requested)
    }

    /// Current lifecycle state, None once terminal and forgotten.
    pub fn state_of(&self, id: RequestId) -> Option<SequenceState> {
        self.lock_records().get(&id).map(|r| r.state)
    }

    /// Record a state change for requests entering a batch.
    pub fn mark(&self, ids: &[RequestId], state: SequenceState, batch: BatchId) {
        {
            let mut records = self.lock_records();
            for id in ids {
                if let Some(record) = records.get_mut(id) {
                    record.state = state;
                }
            }
        }
        for &id in ids {
            let event = match state {
                SequenceState::Batched => SequenceEvent::Batched { id, batch },
                SequenceState::Running => SequenceEvent::Running { id, batch },
                _ => continue,
            };
            emit(&self.events, event);
        }
    }

    /// Tell a streaming submitter that a step produced `new_tokens`, bringing
    /// the total to `generated`. No-op for non-streaming requests and steps
    /// that produced nothing.
    pub fn report_progress(&self, id: RequestId, new_tokens: usize, generated: usize) {
        if new_tokens == 0 {
            return;
        }
        let mut records = self.lock_records();
        let Some(record) = records.get_mut(&id) else {
            return;
        };
        record.generated = generated;
        let progress = StepProgress {
            new_tokens,
            generated,
            restarted: false,
        };
        if let Some(tx) = &record.progress {
            if tx.send(progress).is_err() {
                debug!(request = %id, "Progress receiver dropped");
                record.progress = None;
            }
        }
    }

    /// Return a multi-step request to the queue after a step.
    pub fn requeue(&self, entry: QueuedRequest) -> Result<(), AdmissionError> {
        let id = entry.id;
        let generated = entry.generated;
        if let Some(record) = self.lock_records().get_mut(&id) {
            record.state = SequenceState::Queued;
            record.generated = generated;
        }
        self.lock_scheduler().requeue(entry)?;
        emit(&self.events, SequenceEvent::Requeued { id, generated });
        Ok(())
    }

    /// Move a request to a terminal state, free its pages and notify the
    /// submitter. Returns false if the request was already finished.
    pub fn finish(&self, id: RequestId, outcome: RequestOutcome) -> bool {
        let record = self.lock_records().remove(&id);
        self.cache.release_sequence(id);
        let Some(mut record) = record else {
            return false;
        };

        let event = match &outcome {
            RequestOutcome::Completed { tokens } => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(request = %id, tokens, "Request completed");
                SequenceEvent::Completed { id, tokens: *tokens }
            }
            RequestOutcome::Failed { reason } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(request = %id, reason = %reason, "Request failed");
                SequenceEvent::Failed {
                    id,
                    reason: reason.clone(),
                }
            }
            RequestOutcome::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(request = %id, "Request cancelled");
                SequenceEvent::Cancelled { id }
            }
            RequestOutcome::Expired => {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                info!(request = %id, "Request deadline expired");
                SequenceEvent::Failed {
                    id,
                    reason: "deadline expired".to_string(),
                }
            }
        };
        emit(&self.events, event);
        if let Some(tx) = record.completion.take() {
            let _ = tx.send(outcome);
        }
        true
    }

    /// Apply the eviction policy to every sequence evicted since the last call.
    pub fn reconcile_evictions(&self) {
        let evicted = self.cache.drain_evicted();
        if evicted.is_empty() {
            return;
        }
        let mut sched = self.lock_scheduler();
        for id in evicted {
            self.settle_eviction(id, None, &mut sched);
        }
    }

    /// Apply the eviction policy to one sequence. `popped` is the queue entry
    /// when the caller already took it off the queue.
    pub(crate) fn settle_eviction(&self, id: RequestId, popped: Option<QueuedRequest>, sched: &mut Scheduler) {
        if !self.cache.is_evicted(id) {
            return;
        }

        let recompute = {
            let mut records = self.lock_records();
            match records.get_mut(&id) {
                None => None,
                Some(record) => match self.config.eviction_policy {
                    EvictionPolicy::Recompute { max_recomputes } if record.recomputes < max_recomputes => {
                        record.recomputes += 1;
                        record.state = SequenceState::Queued;
                        record.generated = 0;
                        if let Some(tx) = &record.progress {
                            let _ = tx.send(StepProgress {
                                new_tokens: 0,
                                generated: 0,
                                restarted: true,
                            });
                        }
                        Some(true)
                    }
                    _ => {
                        record.state = SequenceState::Evicted;
                        Some(false)
                    }
                },
            }
        };

        match recompute {
            None => {
                self.cache.release_sequence(id);
            }
            Some(true) => {
                if let Err(e) = self.cache.reset_sequence(id) {
                    warn!(request = %id, error = %e, "Reset after eviction failed");
                }
                match popped {
                    Some(mut entry) => {
                        entry.restart();
                        if let Err(e) = sched.requeue(entry) {
                            warn!(request = %id, error = %e, "Requeue after eviction failed");
                        }
                    }
                    None => {
                        sched.restart(id);
                    }
                }
                self.counters.recomputed.fetch_add(1, Ordering::Relaxed);
                info!(request = %id, "Evicted sequence queued for recompute");
                emit(&self.events, SequenceEvent::Evicted { id, recompute: true });
            }
            Some(false) => {
                if popped.is_none() {
                    sched.cancel(id);
                }
                emit(&self.events, SequenceEvent::Evicted { id, recompute: false });
                self.finish(
                    id,
                    RequestOutcome::Failed {
                        reason: "evicted from KV cache".to_string(),
                    },
                );
            }
        }
    }

    /// React to a round where work was queued but nothing fit: evict the
    /// least recently used idle sequence and reject new work until a batch
    /// forms again.
    pub fn on_memory_pressure(&self) {
        if !self.pressure.swap(true, Ordering::AcqRel) {
            warn!(
                free = self.cache.pool().available(),
                "Memory pressure, applying backpressure"
            );
        }
        if let Some(victim) = self.cache.evict_one() {
            debug!(sequence = %victim, "Evicted under memory pressure");
            self.reconcile_evictions();
        }
    }

    /// Reject new work until the next successful batch.
    pub fn raise_backpressure(&self) {
        if !self.pressure.swap(true, Ordering::AcqRel) {
            warn!("Backpressure raised");
        }
    }

    pub fn relieve_pressure(&self) {
        if self.pressure.swap(false, Ordering::AcqRel) {
            info!("Memory pressure relieved");
        }
    }

    pub fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }

    /// Stop admitting and fail everything still in flight.
    pub fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        let queued = self.lock_scheduler().drain();
        for entry in queued {
            self.finish(
                entry.id,
                RequestOutcome::Failed {
                    reason: reason.to_string(),
                },
            );
        }
        let remaining: Vec<RequestId> = self.lock_records().keys().copied().collect();
        for id in remaining {
            self.finish(
                id,
                RequestOutcome::Failed {
                    reason: reason.to_string(),
                },
            );
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_scheduler().len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock_records().len()
    }

    pub fn stats(&self) -> AdmissionStats {
        let c = &self.counters;
        AdmissionStats {
            admitted: c.admitted.load(Ordering::Relaxed),
            rejected_overflow: c.rejected_overflow.load(Ordering::Relaxed),
            rejected_backpressure: c.rejected_backpressure.load(Ordering::Relaxed),
            rejected_structural: c.rejected_structural.load(Ordering::Relaxed),
            rejected_oom: c.rejected_oom.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            recomputed: c.recomputed.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            backpressure: self.under_pressure(),
            prompt_cache: self.lock_prompts().stats(),
        }
    }
}
