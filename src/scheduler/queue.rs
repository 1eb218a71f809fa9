//! Priority queue of pending requests.
//!
//! Entries pop in `(effective tier, arrival)` order. Arrival numbers are
//! unique and monotonic, so ties inside a tier are broken strictly by arrival
//! and never by request id. Cancellation is a lazy delete: the pending map is
//! authoritative and stale heap entries are skipped (and periodically
//! compacted away).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use thiserror::Error;
use tracing::debug;

use crate::sequence::{Priority, Request, RequestId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Request {0} is already queued")]
    Duplicate(RequestId),
}

/// A request waiting for a batch, plus its scheduling bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub request: Request,

    /// Arrival number. Assigned once at admission and kept across requeues.
    pub arrival: u64,

    /// Tier used for ordering; starts at the request's own priority.
    pub effective: Priority,

    /// Consecutive batch formations that passed this entry over.
    pub deferrals: u32,

    /// Tier levels gained through deferral boosts.
    pub boosts: u8,

    /// Whether the prompt has been prefilled.
    pub prefilled: bool,

    /// Leading prompt tokens restored from the prompt cache. Prefill runs
    /// only the rest.
    pub cached_prefix: usize,

    /// Tokens generated so far.
    pub generated: usize,
}

impl QueuedRequest {
    /// The tier the request was admitted with.
    pub fn tier(&self) -> Priority {
        self.request.priority
    }

    /// New tokens still to generate.
    pub fn remaining(&self) -> usize {
        self.request.max_tokens.saturating_sub(self.generated)
    }

    /// Tokens the sequence holds before its next step.
    pub fn context_tokens(&self) -> usize {
        if self.prefilled {
            self.request.prompt_tokens + self.generated
        } else {
            self.cached_prefix
        }
    }

    /// Whether nothing is left to run.
    pub fn is_finished(&self) -> bool {
        self.prefilled && self.remaining() == 0
    }

    /// Forget progress so the sequence is recomputed from scratch.
    pub fn restart(&mut self) {
        self.prefilled = false;
        self.generated = 0;
        self.cached_prefix = 0;
    }
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    level: u8,
    arrival: u64,
    id: RequestId,
    ticket: u64,
}

// BinaryHeap is a max-heap: the smallest (level, arrival) must compare greatest.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.level, other.arrival).cmp(&(self.level, self.arrival))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Pending {
    entry: QueuedRequest,
    ticket: u64,
}

/// The pending-request queue.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<HeapEntry>,

    /// Live entries; anything in `heap` without a matching ticket here is stale.
    pending: HashMap<RequestId, Pending>,

    /// Live entries per admitted tier, oldest first.
    by_tier: [BTreeMap<u64, RequestId>; 4],

    next_arrival: u64,
    next_ticket: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new request. O(log n).
    pub fn enqueue(&mut self, id: RequestId, request: Request) -> Result<u64, QueueError> {
        self.enqueue_with_prefix(id, request, 0)
    }

    /// Insert a new request whose first `cached_prefix` prompt tokens are
    /// already in the cache.
    pub fn enqueue_with_prefix(
        &mut self,
        id: RequestId,
        request: Request,
        cached_prefix: usize,
    ) -> Result<u64, QueueError> {
        if self.pending.contains_key(&id) {
            return Err(QueueError::Duplicate(id));
        }
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        let effective = request.priority;
        self.insert(QueuedRequest {
            id,
            request,
            arrival,
            effective,
            deferrals: 0,
            boosts: 0,
            prefilled: false,
            cached_prefix,
            generated: 0,
        });
        Ok(arrival)
    }

    /// Put an entry back, keeping its arrival number.
    pub fn requeue(&mut self, entry: QueuedRequest) -> Result<(), QueueError> {
        if self.pending.contains_key(&entry.id) {
            return Err(QueueError::Duplicate(entry.id));
        }
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: QueuedRequest) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.heap.push(HeapEntry {
            level: entry.effective.level(),
            arrival: entry.arrival,
            id: entry.id,
            ticket,
        });
        self.by_tier[entry.tier().level() as usize].insert(entry.arrival, entry.id);
        self.pending.insert(entry.id, Pending { entry, ticket });
    }

    fn take(&mut self, id: RequestId) -> Option<QueuedRequest> {
        let pending = self.pending.remove(&id)?;
        let entry = pending.entry;
        self.by_tier[entry.tier().level() as usize].remove(&entry.arrival);
        self.maybe_compact();
        Some(entry)
    }

    /// Remove and return the most urgent entry.
    pub fn pop(&mut self) -> Option<QueuedRequest> {
        while let Some(top) = self.heap.pop() {
            let live = self
                .pending
                .get(&top.id)
                .is_some_and(|p| p.ticket == top.ticket);
            if live {
                return self.take(top.id);
            }
        }
        None
    }

    /// Remove a queued request (cancellation). The heap entry becomes a tombstone.
    pub fn remove(&mut self, id: RequestId) -> Option<QueuedRequest> {
        let entry = self.take(id)?;
        debug!(request = %id, "Removed request from queue");
        Some(entry)
    }

    /// Remove the oldest entry admitted at `tier`, regardless of boosts.
    pub fn take_oldest_in_tier(&mut self, tier: Priority) -> Option<QueuedRequest> {
        let id = *self.by_tier[tier.level() as usize].values().next()?;
        self.take(id)
    }

    /// Rebuild the heap once tombstones outnumber live entries.
    fn maybe_compact(&mut self) {
        if self.heap.len() <= 2 * self.pending.len() + 16 {
            return;
        }
        let before = self.heap.len();
        let pending = &self.pending;
        self.heap.retain(|h| pending.get(&h.id).is_some_and(|p| p.ticket == h.ticket));
        debug!(before, after = self.heap.len(), "Compacted queue heap");
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn get(&self, id: RequestId) -> Option<&QueuedRequest> {
        self.pending.get(&id).map(|p| &p.entry)
    }

    /// Reset a queued entry's progress in place. Ordering keys are untouched.
    pub fn restart(&mut self, id: RequestId) -> bool {
        match self.pending.get_mut(&id) {
            Some(p) => {
                p.entry.restart();
                true
            }
            None => false,
        }
    }

    /// Remove every live entry, most urgent first.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    /// Live entries admitted at `tier`.
    pub fn tier_len(&self, tier: Priority) -> usize {
        self.by_tier[tier.level() as usize].len()
    }

    /// Heap slots including tombstones.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
