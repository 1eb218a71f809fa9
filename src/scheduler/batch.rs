//! Batch formation.
//!
//! [`Scheduler`] owns the priority queue and the starvation guard. One call
//! to [`Scheduler::form_batch`] is one scheduling round:
//!
//! 1. Every tier due under the starvation guard contributes its oldest
//!    request to the head of the batch, outside the budgets and the size cap.
//! 2. Entries are popped in priority order and added while the batch's token
//!    and page cost stays within budget.
//! 3. Entries that do not fit are deferred and requeued with their original
//!    arrival number. After K consecutive deferrals an entry's tier is boosted
//!    one level, up to `max_priority_boost` levels.
//! 4. An entry that is past its boost ceiling and still deferred K more times
//!    is starved; it is batched alone as soon as it reaches an empty batch,
//!    even if it exceeds the budget on its own.
//!
//! Formation never blocks and is deterministic: identical queue contents and
//! costs always give the same batch composition and order.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::scheduler::fairness::StarvationGuard;
use crate::scheduler::queue::{PriorityQueue, QueueError, QueuedRequest};
use crate::sequence::{Priority, Request, RequestId};

/// Identifier of a batch, unique within one scheduler. 0 marks an empty batch.
pub type BatchId = u64;

/// Kind of work an entry does in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Process the whole prompt.
    Prefill,
    /// Generate up to `decode_chunk` tokens.
    Decode,
}

/// Cost of running one entry for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCost {
    pub kind: StepKind,
    /// Tokens processed.
    pub tokens: usize,
    /// Pages that must be newly claimed.
    pub pages: usize,
}

/// One sequence in a batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub queued: QueuedRequest,
    pub step: StepCost,
}

impl BatchEntry {
    pub fn id(&self) -> RequestId {
        self.queued.id
    }
}

/// A group of sequences executed together in one step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub entries: Vec<BatchEntry>,
    pub token_cost: usize,
    pub page_cost: usize,
    pub formed_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sequence_ids(&self) -> Vec<RequestId> {
        self.entries.iter().map(|e| e.id()).collect()
    }
}

/// A deferral boost applied during one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boost {
    pub id: RequestId,
    pub from: Priority,
    pub to: Priority,
}

/// Everything one scheduling round produced.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch: Batch,
    /// Entries passed over this round (already requeued).
    pub deferred: Vec<RequestId>,
    /// Starvation-guard boosts applied this round.
    pub boosted: Vec<Boost>,
    /// Tiers whose oldest request led the batch by override.
    pub overridden: Vec<Priority>,
    /// Entries dropped because their deadline passed.
    pub expired: Vec<QueuedRequest>,
    /// Work was queued but nothing fit the budgets.
    pub memory_pressure: bool,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_batch_size: usize,
    boost_after: u32,
    max_boost: u8,
}

/// Priority queue plus batch former.
#[derive(Debug)]
pub struct Scheduler {
    queue: PriorityQueue,
    guard: StarvationGuard,
    limits: Limits,
    rounds: u64,
    next_batch: BatchId,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            queue: PriorityQueue::new(),
            guard: StarvationGuard::new(config.starvation_rounds),
            limits: Limits {
                max_batch_size: config.max_batch_size,
                boost_after: config.deferral_boost_after.max(1),
                max_boost: config.max_priority_boost,
            },
            rounds: 0,
            next_batch: 1,
        }
    }

    pub fn enqueue(&mut self, id: RequestId, request: Request) -> Result<u64, QueueError> {
        self.enqueue_with_prefix(id, request, 0)
    }

    /// Queue a request whose first `cached_prefix` prompt tokens are already
    /// in the cache.
    pub fn enqueue_with_prefix(
        &mut self,
        id: RequestId,
        request: Request,
        cached_prefix: usize,
    ) -> Result<u64, QueueError> {
        let arrival = self.queue.enqueue_with_prefix(id, request, cached_prefix)?;
        debug!(request = %id, arrival, cached_prefix, depth = self.queue.len(), "Enqueued request");
        Ok(arrival)
    }

    /// Return an entry to the queue after a step, keeping its arrival number.
    /// Deferral state is cleared; the boost history is not carried over.
    pub fn requeue(&mut self, mut entry: QueuedRequest) -> Result<(), QueueError> {
        entry.deferrals = 0;
        entry.boosts = 0;
        entry.effective = entry.request.priority;
        self.queue.requeue(entry)
    }

    /// Remove a queued request. Returns None if it is not queued.
    pub fn cancel(&mut self, id: RequestId) -> Option<QueuedRequest> {
        self.queue.remove(id)
    }

    /// Reset a queued request's progress so it is recomputed from scratch.
    pub fn restart(&mut self, id: RequestId) -> bool {
        self.queue.restart(id)
    }

    /// Remove every queued request.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.queue.drain()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.queue.contains(id)
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn guard(&self) -> &StarvationGuard {
        &self.guard
    }

    /// Scheduling rounds run so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    fn is_starved(&self, entry: &QueuedRequest) -> bool {
        let at_ceiling = entry.boosts >= self.limits.max_boost || entry.effective.boost().is_none();
        at_ceiling && entry.deferrals >= self.limits.boost_after
    }

    /// Count a deferral and boost the entry's tier if it is due.
    fn defer(&self, entry: &mut QueuedRequest) -> Option<Boost> {
        entry.deferrals += 1;
        if entry.deferrals < self.limits.boost_after || entry.boosts >= self.limits.max_boost {
            return None;
        }
        let to = entry.effective.boost()?;
        let boost = Boost {
            id: entry.id,
            from: entry.effective,
            to,
        };
        entry.effective = to;
        entry.boosts += 1;
        entry.deferrals = 0;
        Some(boost)
    }

    /// Run one scheduling round.
    ///
    /// `cost` gives the step cost of an entry. The call never blocks; it
    /// returns an empty batch when nothing is queued or nothing fits.
    pub fn form_batch(
        &mut self,
        token_budget: usize,
        memory_budget: usize,
        cost: impl Fn(&QueuedRequest) -> StepCost,
    ) -> BatchOutcome {
        self.rounds += 1;
        let mut waiting = [false; 4];
        for tier in Priority::ALL {
            waiting[tier.level() as usize] = self.queue.tier_len(tier) > 0;
        }

        let mut entries: Vec<BatchEntry> = Vec::new();
        let mut deferred: Vec<QueuedRequest> = Vec::new();
        let mut expired = Vec::new();
        let mut tokens = 0usize;
        let mut pages = 0usize;

        let mut overridden = Vec::new();
        for tier in self.guard.due(&waiting) {
            while let Some(entry) = self.queue.take_oldest_in_tier(tier) {
                if entry.request.is_expired() {
                    expired.push(entry);
                    continue;
                }
                let step = cost(&entry);
                info!(
                    request = %entry.id,
                    tier = %tier,
                    skipped = self.guard.skipped(tier),
                    "Starvation guard override"
                );
                tokens += step.tokens;
                pages += step.pages;
                entries.push(BatchEntry { queued: entry, step });
                overridden.push(tier);
                break;
            }
        }
        // Overrides past the budget leave no room for anything else.
        let mut solo = tokens > token_budget || pages > memory_budget;

        let scan = self.queue.len();
        for _ in 0..scan {
            if solo || entries.len() >= self.limits.max_batch_size || tokens >= token_budget {
                break;
            }
            let Some(entry) = self.queue.pop() else { break };
            if entry.request.is_expired() {
                expired.push(entry);
                continue;
            }
            let step = cost(&entry);
            if tokens + step.tokens <= token_budget && pages + step.pages <= memory_budget {
                tokens += step.tokens;
                pages += step.pages;
                entries.push(BatchEntry { queued: entry, step });
            } else if entries.is_empty() && self.is_starved(&entry) {
                info!(
                    request = %entry.id,
                    tokens = step.tokens,
                    pages = step.pages,
                    "Batching starved oversized request alone"
                );
                tokens += step.tokens;
                pages += step.pages;
                entries.push(BatchEntry { queued: entry, step });
                solo = true;
            } else {
                deferred.push(entry);
            }
        }

        let mut boosted = Vec::new();
        let mut deferred_ids = Vec::with_capacity(deferred.len());
        for mut entry in deferred {
            if let Some(boost) = self.defer(&mut entry) {
                info!(
                    request = %boost.id,
                    from = %boost.from,
                    to = %boost.to,
                    "Starvation guard boosted request"
                );
                boosted.push(boost);
            }
            deferred_ids.push(entry.id);
            // The entry was just popped, so its id cannot be queued twice.
            let _ = self.queue.requeue(entry);
        }

        let mut contributed = [false; 4];
        for entry in &entries {
            contributed[entry.queued.tier().level() as usize] = true;
        }
        self.guard.record_round(&waiting, &contributed);

        let memory_pressure = entries.is_empty() && !deferred_ids.is_empty();
        let batch = Batch {
            id: if entries.is_empty() {
                0
            } else {
                self.next_batch += 1;
                self.next_batch - 1
            },
            entries,
            token_cost: tokens,
            page_cost: pages,
            formed_at: Instant::now(),
        };
        if !batch.is_empty() {
            debug!(
                batch = batch.id,
                size = batch.len(),
                tokens,
                pages,
                deferred = deferred_ids.len(),
                "Formed batch"
            );
        }

        BatchOutcome {
            batch,
            deferred: deferred_ids,
            boosted,
            overridden,
            expired,
            memory_pressure,
        }
    }
}

/// Step cost of an entry from its progress.
///
/// `owned_pages` is how many pages the sequence already holds.
pub fn step_cost(
    entry: &QueuedRequest,
    decode_chunk: usize,
    page_tokens: usize,
    owned_pages: usize,
) -> StepCost {
    let (kind, tokens, after) = if entry.prefilled {
        let chunk = decode_chunk.min(entry.remaining());
        (StepKind::Decode, chunk, entry.context_tokens() + chunk)
    } else {
        let prompt = entry.request.prompt_tokens;
        (StepKind::Prefill, prompt - entry.cached_prefix.min(prompt), prompt)
    };
    let needed = crate::sequence::pages_for_tokens(after, page_tokens);
    StepCost {
        kind,
        tokens,
        pages: needed.saturating_sub(owned_pages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_batch_size: 8,
            deferral_boost_after: 2,
            max_priority_boost: 1,
            starvation_rounds: 100,
            ..SchedulerConfig::default()
        }
    }

    fn prefill_cost(entry: &QueuedRequest) -> StepCost {
        step_cost(entry, 16, 16, 0)
    }

    #[test]
    fn test_high_before_low() {
        let mut sched = Scheduler::new(&config());
        sched
            .enqueue(RequestId(1), Request::generate(32, 0).with_priority(Priority::Low))
            .unwrap();
        sched
            .enqueue(RequestId(2), Request::generate(32, 0).with_priority(Priority::High))
            .unwrap();

        let out = sched.form_batch(100, 100, prefill_cost);
        assert_eq!(out.batch.sequence_ids(), vec![RequestId(2), RequestId(1)]);
        assert!(out.deferred.is_empty());
        assert!(sched.is_empty());
    }

    #[test]
    fn test_oversized_is_deferred_not_blocking() {
        let mut sched = Scheduler::new(&config());
        sched
            .enqueue(RequestId(1), Request::generate(500, 0).with_priority(Priority::High))
            .unwrap();
        sched.enqueue(RequestId(2), Request::generate(32, 0)).unwrap();

        let out = sched.form_batch(100, 100, prefill_cost);
        assert_eq!(out.batch.sequence_ids(), vec![RequestId(2)]);
        assert_eq!(out.deferred, vec![RequestId(1)]);
        assert!(sched.contains(RequestId(1)));
        assert!(!out.memory_pressure);
    }

    #[test]
    fn test_deferral_boost_is_bounded() {
        let mut sched = Scheduler::new(&config());
        sched
            .enqueue(RequestId(1), Request::generate(500, 0).with_priority(Priority::Low))
            .unwrap();

        // Two deferrals boost Low to Normal; the ceiling is one level.
        let mut boosts = Vec::new();
        for _ in 0..6 {
            let out = sched.form_batch(100, 100, prefill_cost);
            boosts.extend(out.boosted);
            if !out.batch.is_empty() {
                break;
            }
            assert!(out.memory_pressure);
        }
        assert_eq!(
            boosts,
            vec![Boost {
                id: RequestId(1),
                from: Priority::Low,
                to: Priority::Normal
            }]
        );
    }

    #[test]
    fn test_starved_oversized_runs_alone() {
        let mut sched = Scheduler::new(&config());
        sched.enqueue(RequestId(1), Request::generate(500, 0)).unwrap();

        let mut rounds = 0;
        let batch = loop {
            rounds += 1;
            let out = sched.form_batch(100, 100, prefill_cost);
            if !out.batch.is_empty() {
                break out.batch;
            }
            assert!(rounds < 10, "oversized request never ran");
        };
        assert_eq!(batch.sequence_ids(), vec![RequestId(1)]);
        assert!(batch.token_cost > 100);
    }

    #[test]
    fn test_starvation_override_leads_batch() {
        let mut cfg = config();
        cfg.starvation_rounds = 3;
        cfg.max_batch_size = 1;
        let mut sched = Scheduler::new(&cfg);
        sched
            .enqueue(RequestId(0), Request::generate(16, 0).with_priority(Priority::Low))
            .unwrap();

        let mut next = 1;
        let mut served_in = None;
        for round in 1..=3 {
            sched
                .enqueue(RequestId(next), Request::generate(16, 0).with_priority(Priority::Critical))
                .unwrap();
            next += 1;
            let out = sched.form_batch(1000, 1000, prefill_cost);
            if out.batch.sequence_ids().contains(&RequestId(0)) {
                assert_eq!(out.overridden, vec![Priority::Low]);
                served_in = Some(round);
                break;
            }
        }
        assert_eq!(served_in, Some(3));
    }

    #[test]
    fn test_every_starving_tier_served_in_the_same_round() {
        let mut cfg = config();
        cfg.starvation_rounds = 3;
        cfg.max_batch_size = 1;
        cfg.deferral_boost_after = 1000;
        let mut sched = Scheduler::new(&cfg);
        for (id, tier) in [(1, Priority::High), (2, Priority::Normal), (3, Priority::Low)] {
            sched
                .enqueue(RequestId(id), Request::generate(16, 0).with_priority(tier))
                .unwrap();
        }

        let mut next = 10;
        for round in 1..=3 {
            for _ in 0..3 {
                sched
                    .enqueue(RequestId(next), Request::generate(16, 0).with_priority(Priority::Critical))
                    .unwrap();
                next += 1;
            }
            let out = sched.form_batch(1000, 1000, prefill_cost);
            if round < 3 {
                assert_eq!(out.batch.len(), 1);
                assert!(out.overridden.is_empty());
            } else {
                assert_eq!(
                    out.overridden,
                    vec![Priority::High, Priority::Normal, Priority::Low]
                );
                assert_eq!(
                    out.batch.sequence_ids(),
                    vec![RequestId(1), RequestId(2), RequestId(3)]
                );
            }
        }
    }

    #[test]
    fn test_batch_ids_are_per_scheduler() {
        let mut a = Scheduler::new(&config());
        let mut b = Scheduler::new(&config());
        a.enqueue(RequestId(1), Request::generate(16, 0)).unwrap();
        b.enqueue(RequestId(1), Request::generate(16, 0)).unwrap();
        assert_eq!(a.form_batch(100, 100, prefill_cost).batch.id, 1);
        assert_eq!(b.form_batch(100, 100, prefill_cost).batch.id, 1);
        assert_eq!(a.form_batch(100, 100, prefill_cost).batch.id, 0);
    }

    #[test]
    fn test_expired_dropped() {
        let mut sched = Scheduler::new(&config());
        let past = Instant::now() - std::time::Duration::from_secs(1);
        sched
            .enqueue(RequestId(1), Request::generate(16, 0).with_deadline(past))
            .unwrap();
        let out = sched.form_batch(100, 100, prefill_cost);
        assert!(out.batch.is_empty());
        assert_eq!(out.expired.len(), 1);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_step_cost_decode() {
        let mut entry = QueuedRequest {
            id: RequestId(1),
            request: Request::generate(30, 40),
            arrival: 0,
            effective: Priority::Normal,
            deferrals: 0,
            boosts: 0,
            prefilled: false,
            cached_prefix: 0,
            generated: 0,
        };
        let prefill = step_cost(&entry, 16, 16, 2);
        assert_eq!(prefill.kind, StepKind::Prefill);
        assert_eq!(prefill.tokens, 30);
        assert_eq!(prefill.pages, 0);

        entry.prefilled = true;
        entry.generated = 32;
        let decode = step_cost(&entry, 16, 16, 4);
        assert_eq!(decode.kind, StepKind::Decode);
        assert_eq!(decode.tokens, 8);
        // 30 + 32 + 8 = 70 tokens → 5 pages
        assert_eq!(decode.pages, 1);
    }

    #[test]
    fn test_step_cost_prefill_skips_cached_prefix() {
        let mut sched = Scheduler::new(&config());
        sched.enqueue_with_prefix(RequestId(1), Request::generate(40, 4), 29).unwrap();
        let out = sched.form_batch(100, 100, |e| step_cost(e, 16, 16, 3));
        let entry = &out.batch.entries[0];
        assert_eq!(entry.queued.context_tokens(), 29);
        assert_eq!(entry.step.kind, StepKind::Prefill);
        assert_eq!(entry.step.tokens, 11);
        assert_eq!(entry.step.pages, 0);

        let mut restarted = entry.queued.clone();
        restarted.restart();
        assert_eq!(step_cost(&restarted, 16, 16, 0).tokens, 40);
    }
}
