//! Fixed-capacity page allocator.
//!
//! Manages the page arena as a pool of equally sized pages.
//! Uses a single guarded free list with O(1) acquire/release, plus an owner
//! table so that every page is either free or owned by exactly one sequence.
//!
//! When the free list is empty, [`PagePool::acquire`] asks a [`Reclaimer`]
//! (the KV cache manager) to evict before failing with `OutOfMemory`. In
//! blocking mode it then waits for a release until the configured timeout.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::page::PageId;
use crate::config::AcquireMode;
use crate::sequence::SequenceId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Out of memory: no free pages among {capacity} after eviction")]
    OutOfMemory { capacity: usize },

    #[error("Page {0} is outside the pool")]
    InvalidPage(PageId),

    #[error("Page {page} is not owned by {owner}")]
    NotOwner { page: PageId, owner: SequenceId },

    #[error("Page {0} is not free")]
    PageNotFree(PageId),
}

/// Something that can free pages on demand.
pub trait Reclaimer {
    /// Try to return at least one page to the pool. `requester` must never be
    /// chosen as the victim. Returns false when nothing could be reclaimed.
    fn reclaim(&self, requester: Option<SequenceId>) -> bool;
}

/// A reclaimer that never frees anything.
pub struct NoReclaim;

impl Reclaimer for NoReclaim {
    fn reclaim(&self, _requester: Option<SequenceId>) -> bool {
        false
    }
}

#[derive(Debug)]
struct PoolInner {
    /// Free page ids, acquired from the front.
    free_list: VecDeque<PageId>,

    /// Current owner of each page, `None` when free.
    owners: Vec<Option<SequenceId>>,

    /// Acquire and release operations since the last compaction.
    churn: u64,
}

/// The page pool shared by every sequence of one runtime.
pub struct PagePool {
    inner: Mutex<PoolInner>,

    /// Signalled whenever a page is returned to the free list.
    freed: Condvar,

    capacity: usize,

    mode: AcquireMode,
}

impl PagePool {
    /// Create a pool of `capacity` pages, all free.
    pub fn new(capacity: usize, mode: AcquireMode) -> Self {
        let free_list = (0..capacity as u32).map(PageId).collect();
        Self {
            inner: Mutex::new(PoolInner {
                free_list,
                owners: vec![None; capacity],
                churn: 0,
            }),
            freed: Condvar::new(),
            capacity,
            mode,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Page pool mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Take a page from the free list without reclaiming.
    pub fn try_acquire(&self, owner: SequenceId) -> Result<PageId, AllocatorError> {
        let mut inner = self.lock();
        Self::pop_free(&mut inner, owner).ok_or(AllocatorError::OutOfMemory {
            capacity: self.capacity,
        })
    }

    fn pop_free(inner: &mut PoolInner, owner: SequenceId) -> Option<PageId> {
        let page = inner.free_list.pop_front()?;
        inner.owners[page.index()] = Some(owner);
        inner.churn += 1;
        Some(page)
    }

    /// Acquire a page for `owner`, asking `reclaimer` to evict when the pool is
    /// exhausted. Fails with `OutOfMemory` only once reclamation produced
    /// nothing (and, in blocking mode, no release arrived before the timeout).
    pub fn acquire(
        &self,
        owner: SequenceId,
        reclaimer: &dyn Reclaimer,
    ) -> Result<PageId, AllocatorError> {
        let deadline = self.mode.timeout().map(|t| Instant::now() + t);
        loop {
            if let Ok(page) = self.try_acquire(owner) {
                debug!(page = %page, owner = %owner, "Acquired page");
                return Ok(page);
            }

            if reclaimer.reclaim(Some(owner)) {
                continue;
            }

            let Some(deadline) = deadline else {
                return Err(AllocatorError::OutOfMemory {
                    capacity: self.capacity,
                });
            };

            let mut inner = self.lock();
            while inner.free_list.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    debug!(owner = %owner, "Timed out waiting for a free page");
                    return Err(AllocatorError::OutOfMemory {
                        capacity: self.capacity,
                    });
                }
                let (guard, _) = self
                    .freed
                    .wait_timeout(inner, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                inner = guard;
            }
            if let Some(page) = Self::pop_free(&mut inner, owner) {
                return Ok(page);
            }
        }
    }

    /// Return a page to the free list.
    ///
    /// Only the current owner can release a page; a double release or a
    /// release by anyone else is a logged no-op. Returns whether the page was
    /// actually freed.
    pub fn release(&self, page: PageId, owner: SequenceId) -> bool {
        let mut inner = self.lock();
        match inner.owners.get(page.index()) {
            Some(Some(current)) if *current == owner => {}
            Some(current) => {
                warn!(page = %page, owner = %owner, current = ?current, "Ignoring release by non-owner");
                return false;
            }
            None => {
                warn!(page = %page, "Ignoring release of page outside the pool");
                return false;
            }
        }
        inner.owners[page.index()] = None;
        inner.free_list.push_back(page);
        inner.churn += 1;
        drop(inner);
        self.freed.notify_one();
        true
    }

    /// Move ownership of `from` onto the free page `to`; `from` becomes free.
    pub fn relocate(
        &self,
        from: PageId,
        to: PageId,
        owner: SequenceId,
    ) -> Result<(), AllocatorError> {
        let mut inner = self.lock();
        if from.index() >= self.capacity {
            return Err(AllocatorError::InvalidPage(from));
        }
        if to.index() >= self.capacity {
            return Err(AllocatorError::InvalidPage(to));
        }
        if inner.owners[from.index()] != Some(owner) {
            return Err(AllocatorError::NotOwner { page: from, owner });
        }
        let pos = inner
            .free_list
            .iter()
            .position(|p| *p == to)
            .ok_or(AllocatorError::PageNotFree(to))?;
        inner.free_list.remove(pos);
        inner.owners[to.index()] = Some(owner);
        inner.owners[from.index()] = None;
        inner.free_list.push_back(from);
        Ok(())
    }

    /// Current owner of a page.
    pub fn owner_of(&self, page: PageId) -> Option<SequenceId> {
        self.lock().owners.get(page.index()).copied().flatten()
    }

    /// Free page ids in ascending order.
    pub fn free_pages_sorted(&self) -> Vec<PageId> {
        let mut free: Vec<PageId> = self.lock().free_list.iter().copied().collect();
        free.sort_unstable();
        free
    }

    /// Sort the free list so low ids are handed out first.
    pub fn compact_free_list(&self) {
        let mut inner = self.lock();
        inner.free_list.make_contiguous().sort_unstable();
    }

    /// Whether `acquire` waits for a release once reclamation fails.
    pub fn blocks(&self) -> bool {
        self.mode.timeout().is_some()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pages currently owned by some sequence.
    pub fn in_use(&self) -> usize {
        self.capacity - self.lock().free_list.len()
    }

    /// Pages on the free list.
    pub fn available(&self) -> usize {
        self.lock().free_list.len()
    }

    pub fn churn(&self) -> u64 {
        self.lock().churn
    }

    pub fn reset_churn(&self) {
        self.lock().churn = 0;
    }

    /// Fraction of pages in use (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.in_use() as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const A: SequenceId = SequenceId(1);
    const B: SequenceId = SequenceId(2);

    #[test]
    fn test_acquire_and_release() {
        let pool = PagePool::new(4, AcquireMode::FailFast);

        let pages: Vec<_> = (0..4).map(|_| pool.try_acquire(A).unwrap()).collect();
        assert_eq!(pool.in_use(), 4);

        // Pool is full.
        assert!(matches!(
            pool.acquire(A, &NoReclaim),
            Err(AllocatorError::OutOfMemory { capacity: 4 })
        ));

        assert!(pool.release(pages[0], A));
        assert_eq!(pool.in_use(), 3);
        pool.try_acquire(B).unwrap();
    }

    #[test]
    fn test_double_release_is_noop() {
        let pool = PagePool::new(2, AcquireMode::FailFast);
        let page = pool.try_acquire(A).unwrap();

        assert!(pool.release(page, A));
        assert!(!pool.release(page, A));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_release_by_non_owner_rejected() {
        let pool = PagePool::new(2, AcquireMode::FailFast);
        let page = pool.try_acquire(A).unwrap();

        assert!(!pool.release(page, B));
        assert_eq!(pool.owner_of(page), Some(A));
        assert!(!pool.release(PageId(99), A));
    }

    struct FreeOne<'a> {
        pool: &'a PagePool,
        page: PageId,
        owner: SequenceId,
    }

    impl Reclaimer for FreeOne<'_> {
        fn reclaim(&self, _requester: Option<SequenceId>) -> bool {
            self.pool.release(self.page, self.owner)
        }
    }

    #[test]
    fn test_acquire_reclaims_before_failing() {
        let pool = PagePool::new(1, AcquireMode::FailFast);
        let page = pool.try_acquire(A).unwrap();

        let reclaimer = FreeOne {
            pool: &pool,
            page,
            owner: A,
        };
        let got = pool.acquire(B, &reclaimer).unwrap();
        assert_eq!(got, page);
        assert_eq!(pool.owner_of(got), Some(B));

        // Second time the reclaimer has nothing left to free.
        assert!(pool.acquire(B, &reclaimer).is_err());
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let pool = Arc::new(PagePool::new(
            1,
            AcquireMode::Block { timeout_ms: 2_000 },
        ));
        let page = pool.try_acquire(A).unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                pool.release(page, A);
            })
        };

        let got = pool.acquire(B, &NoReclaim).unwrap();
        assert_eq!(pool.owner_of(got), Some(B));
        releaser.join().unwrap();
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let pool = PagePool::new(1, AcquireMode::Block { timeout_ms: 10 });
        pool.try_acquire(A).unwrap();
        assert!(pool.acquire(B, &NoReclaim).is_err());
    }

    #[test]
    fn test_relocate_transfers_ownership() {
        let pool = PagePool::new(4, AcquireMode::FailFast);
        let _ = pool.try_acquire(A).unwrap(); // page 0
        let high = pool.try_acquire(B).unwrap(); // page 1
        pool.release(PageId(0), A);

        pool.relocate(high, PageId(0), B).unwrap();
        assert_eq!(pool.owner_of(PageId(0)), Some(B));
        assert_eq!(pool.owner_of(high), None);
        assert_eq!(pool.in_use(), 1);

        assert_eq!(
            pool.relocate(PageId(0), PageId(0), A),
            Err(AllocatorError::NotOwner {
                page: PageId(0),
                owner: A
            })
        );
    }

    #[test]
    fn test_utilization_and_churn() {
        let pool = PagePool::new(4, AcquireMode::FailFast);
        assert_eq!(pool.utilization(), 0.0);

        let p = pool.try_acquire(A).unwrap();
        pool.try_acquire(A).unwrap();
        assert!((pool.utilization() - 0.5).abs() < 1e-10);

        pool.release(p, A);
        assert_eq!(pool.churn(), 3);
        pool.reset_churn();
        assert_eq!(pool.churn(), 0);
    }
}
