//! Per-worker batch deques with tail stealing.
//!
//! Steal protocol:
//! - The dispatcher pushes new batches to the back of one worker's deque.
//! - The owning worker pops from the front (oldest first).
//! - An idle worker with an empty deque steals from the back of its peers,
//!   scanning from `(id + 1) % n` so thieves spread over different victims.
//!
//! Owner and thieves work opposite ends, so a steal only contends with the
//! owner when a single batch is left.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::scheduler::batch::Batch;

pub struct WorkQueues {
    queues: Vec<Mutex<VecDeque<Batch>>>,
}

impl WorkQueues {
    pub fn new(workers: usize) -> Self {
        Self {
            queues: (0..workers.max(1)).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    fn lock(&self, worker: usize) -> MutexGuard<'_, VecDeque<Batch>> {
        self.queues[worker % self.queues.len()]
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Append a batch to a worker's deque.
    pub fn push(&self, worker: usize, batch: Batch) {
        self.lock(worker).push_back(batch);
    }

    /// Owner pop: front of the worker's own deque.
    pub fn pop_local(&self, worker: usize) -> Option<Batch> {
        self.lock(worker).pop_front()
    }

    /// Steal from the back of the first non-empty peer. Returns the victim.
    pub fn steal(&self, thief: usize) -> Option<(usize, Batch)> {
        let n = self.queues.len();
        (1..n)
            .map(|offset| (thief + offset) % n)
            .find_map(|victim| self.lock(victim).pop_back().map(|b| (victim, b)))
    }

    /// Own work first, then stolen work.
    pub fn next_for(&self, worker: usize) -> Option<Batch> {
        self.pop_local(worker)
            .or_else(|| self.steal(worker).map(|(_, batch)| batch))
    }

    /// Worker with the fewest queued batches (lowest index on ties).
    pub fn least_loaded(&self) -> usize {
        (0..self.queues.len())
            .min_by_key(|w| self.lock(*w).len())
            .unwrap_or(0)
    }

    pub fn len(&self, worker: usize) -> usize {
        self.lock(worker).len()
    }

    pub fn lengths(&self) -> Vec<usize> {
        (0..self.queues.len()).map(|w| self.lock(w).len()).collect()
    }

    pub fn total(&self) -> usize {
        self.lengths().iter().sum()
    }

    /// Remove every queued batch.
    pub fn drain(&self) -> Vec<Batch> {
        (0..self.queues.len())
            .flat_map(|w| self.lock(w).drain(..).collect::<Vec<_>>())
            .collect()
    }
}
