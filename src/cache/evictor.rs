//! Eviction policy: decides which sequence gives up its pages.
//!
//! Candidates are sequences with no pinned pages. Ranking:
//! - Oldest least-recently-used page first (smallest access tick)
//! - Then the sequence holding more pages (frees more at once)
//! - Then the lower sequence id, so selection is deterministic
//!
//! The victim's pages are reclaimed oldest-access first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::cache::page::PageId;
use crate::sequence::SequenceId;

/// An eviction candidate with the facts it is ranked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub sequence_id: SequenceId,
    /// Access tick of the sequence's least recently used page.
    pub oldest_access: u64,
    pub pages: usize,
}

// Greater = evicted first.
impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .oldest_access
            .cmp(&self.oldest_access)
            .then(self.pages.cmp(&other.pages))
            .then(other.sequence_id.cmp(&self.sequence_id))
    }
}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The eviction policy engine.
#[derive(Debug, Default)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Rank candidates, best victim first. Sequences in `protected` and
    /// sequences without pages are skipped.
    pub fn rank(
        &self,
        candidates: impl IntoIterator<Item = EvictionCandidate>,
        protected: &[SequenceId],
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = candidates
            .into_iter()
            .filter(|c| c.pages > 0 && !protected.contains(&c.sequence_id))
            .collect();

        let mut ranked = Vec::with_capacity(heap.len());
        while let Some(candidate) = heap.pop() {
            ranked.push(candidate);
        }
        ranked
    }

    /// Order a victim's pages for reclamation: oldest access first, page id
    /// breaking ties.
    pub fn reclaim_order(&self, mut pages: Vec<(PageId, u64)>) -> Vec<PageId> {
        pages.sort_by_key(|&(page, tick)| (tick, page));
        pages.into_iter().map(|(page, _)| page).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, oldest: u64, pages: usize) -> EvictionCandidate {
        EvictionCandidate {
            sequence_id: SequenceId(id),
            oldest_access: oldest,
            pages,
        }
    }

    #[test]
    fn test_oldest_access_evicted_first() {
        let evictor = Evictor::new();
        let ranked = evictor.rank(
            vec![candidate(1, 30, 4), candidate(2, 10, 1), candidate(3, 20, 50)],
            &[],
        );
        let order: Vec<u64> = ranked.iter().map(|c| c.sequence_id.0).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_ties_prefer_more_pages_then_lower_id() {
        let evictor = Evictor::new();
        let ranked = evictor.rank(
            vec![candidate(5, 10, 2), candidate(4, 10, 2), candidate(6, 10, 9)],
            &[],
        );
        let order: Vec<u64> = ranked.iter().map(|c| c.sequence_id.0).collect();
        assert_eq!(order, vec![6, 4, 5]);
    }

    #[test]
    fn test_protected_and_empty_excluded() {
        let evictor = Evictor::new();
        let ranked = evictor.rank(
            vec![candidate(1, 1, 3), candidate(2, 2, 0), candidate(3, 3, 1)],
            &[SequenceId(1)],
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].sequence_id, SequenceId(3));
    }

    #[test]
    fn test_reclaim_order() {
        let evictor = Evictor::new();
        let order = evictor.reclaim_order(vec![
            (PageId(4), 9),
            (PageId(1), 3),
            (PageId(2), 3),
        ]);
        assert_eq!(order, vec![PageId(1), PageId(2), PageId(4)]);
    }
}
