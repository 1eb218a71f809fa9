//! Page table: (sequence, logical block index) → physical page.
//!
//! Also tracks per-page metadata: owner, logical position, last access tick
//! and quantization parameters. Last access is atomic so reads can touch
//! pages while holding only the shared lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::cache::page::{PageId, PageParams};
use crate::sequence::SequenceId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageTableError {
    #[error("{sequence} already maps block {index}")]
    SlotTaken { sequence: SequenceId, index: usize },

    #[error("Page {0} is already mapped")]
    PageTaken(PageId),

    #[error("Page {0} is not mapped")]
    NotMapped(PageId),

    #[error("Page {0} is outside the table")]
    OutOfRange(PageId),
}

/// Metadata for one mapped page.
#[derive(Debug)]
pub struct PageMeta {
    pub owner: SequenceId,
    pub logical_index: usize,
    pub last_access: AtomicU64,
    pub params: PageParams,
}

#[derive(Debug)]
pub struct PageTable {
    mapping: HashMap<(SequenceId, usize), PageId>,
    meta: Vec<Option<PageMeta>>,
}

impl PageTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            mapping: HashMap::new(),
            meta: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Map a page at a sequence's logical block index.
    pub fn insert(
        &mut self,
        sequence: SequenceId,
        index: usize,
        page: PageId,
        tick: u64,
    ) -> Result<(), PageTableError> {
        let slot = self
            .meta
            .get_mut(page.index())
            .ok_or(PageTableError::OutOfRange(page))?;
        if slot.is_some() {
            return Err(PageTableError::PageTaken(page));
        }
        if self.mapping.contains_key(&(sequence, index)) {
            return Err(PageTableError::SlotTaken { sequence, index });
        }
        *slot = Some(PageMeta {
            owner: sequence,
            logical_index: index,
            last_access: AtomicU64::new(tick),
            params: PageParams::default(),
        });
        self.mapping.insert((sequence, index), page);
        Ok(())
    }

    /// Unmap a page, returning its metadata.
    pub fn remove(&mut self, page: PageId) -> Option<PageMeta> {
        let meta = self.meta.get_mut(page.index())?.take()?;
        self.mapping.remove(&(meta.owner, meta.logical_index));
        Some(meta)
    }

    pub fn lookup(&self, sequence: SequenceId, index: usize) -> Option<PageId> {
        self.mapping.get(&(sequence, index)).copied()
    }

    pub fn meta(&self, page: PageId) -> Option<&PageMeta> {
        self.meta.get(page.index())?.as_ref()
    }

    pub fn params(&self, page: PageId) -> Option<PageParams> {
        self.meta(page).map(|m| m.params)
    }

    pub fn set_params(&mut self, page: PageId, params: PageParams) -> Result<(), PageTableError> {
        let meta = self
            .meta
            .get_mut(page.index())
            .and_then(|m| m.as_mut())
            .ok_or(PageTableError::NotMapped(page))?;
        meta.params = params;
        Ok(())
    }

    /// Record an access. Ticks only move forward.
    pub fn touch(&self, page: PageId, tick: u64) {
        if let Some(meta) = self.meta(page) {
            meta.last_access.fetch_max(tick, Ordering::Relaxed);
        }
    }

    pub fn last_access(&self, page: PageId) -> Option<u64> {
        self.meta(page)
            .map(|m| m.last_access.load(Ordering::Relaxed))
    }

    /// Oldest access tick among `pages`.
    pub fn oldest_access(&self, pages: &[PageId]) -> Option<u64> {
        pages.iter().filter_map(|p| self.last_access(*p)).min()
    }

    /// Re-home a mapped page onto an unmapped one.
    pub fn move_page(&mut self, from: PageId, to: PageId) -> Result<(), PageTableError> {
        if to.index() >= self.meta.len() {
            return Err(PageTableError::OutOfRange(to));
        }
        if self.meta[to.index()].is_some() {
            return Err(PageTableError::PageTaken(to));
        }
        let meta = self
            .meta
            .get_mut(from.index())
            .and_then(|m| m.take())
            .ok_or(PageTableError::NotMapped(from))?;
        self.mapping.insert((meta.owner, meta.logical_index), to);
        self.meta[to.index()] = Some(meta);
        Ok(())
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQ: SequenceId = SequenceId(7);

    #[test]
    fn test_insert_and_lookup() {
        let mut table = PageTable::new(4);
        table.insert(SEQ, 0, PageId(2), 1).unwrap();
        table.insert(SEQ, 1, PageId(0), 1).unwrap();

        assert_eq!(table.lookup(SEQ, 0), Some(PageId(2)));
        assert_eq!(table.lookup(SEQ, 1), Some(PageId(0)));
        assert_eq!(table.lookup(SEQ, 2), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_double_mapping_rejected() {
        let mut table = PageTable::new(4);
        table.insert(SEQ, 0, PageId(1), 1).unwrap();

        assert_eq!(
            table.insert(SequenceId(8), 0, PageId(1), 1),
            Err(PageTableError::PageTaken(PageId(1)))
        );
        assert_eq!(
            table.insert(SEQ, 0, PageId(2), 1),
            Err(PageTableError::SlotTaken {
                sequence: SEQ,
                index: 0
            })
        );
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut table = PageTable::new(2);
        table.insert(SEQ, 0, PageId(0), 5).unwrap();
        table.touch(PageId(0), 3);
        assert_eq!(table.last_access(PageId(0)), Some(5));
        table.touch(PageId(0), 9);
        assert_eq!(table.last_access(PageId(0)), Some(9));
    }

    #[test]
    fn test_move_page() {
        let mut table = PageTable::new(4);
        table.insert(SEQ, 3, PageId(3), 1).unwrap();
        table.move_page(PageId(3), PageId(0)).unwrap();

        assert_eq!(table.lookup(SEQ, 3), Some(PageId(0)));
        assert!(table.meta(PageId(3)).is_none());
        assert_eq!(table.meta(PageId(0)).unwrap().logical_index, 3);
    }

    #[test]
    fn test_remove_unmaps() {
        let mut table = PageTable::new(2);
        table.insert(SEQ, 0, PageId(1), 1).unwrap();
        let meta = table.remove(PageId(1)).unwrap();
        assert_eq!(meta.owner, SEQ);
        assert!(table.is_empty());
        assert!(table.remove(PageId(1)).is_none());
    }
}
