//! KV cache manager: the central coordinator for paged KV storage.
//!
//! The manager is the only component that touches page contents. It:
//! - Tracks every live sequence and its ordered page chain
//! - Grows chains on append, quantizing each page's vectors on the way in
//! - Dequantizes on read
//! - Evicts idle sequences when the pool runs dry (it is the pool's [`Reclaimer`])
//! - Compacts live pages into low page ids once free-list churn is high
//!
//! Lock order, outermost first: sequence map, sequence state, page table,
//! page slot, pool. Eviction takes a victim's state lock with `try_lock`, so a
//! caller that already holds its own state lock can trigger eviction safely.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::allocator::{AllocatorError, PagePool, Reclaimer};
use crate::cache::evictor::{EvictionCandidate, Evictor};
use crate::cache::page::{KvVectors, PageId, PageParams, PageStore};
use crate::cache::page_table::{PageTable, PageTableError};
use crate::cache::quantizer::{self, QuantParams};
use crate::config::{CacheConfig, ModelConfig};
use crate::sequence::{pages_for_tokens, Priority, SequenceId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Out of memory: {sequence} needs {needed} more pages and nothing is evictable")]
    OutOfMemory { sequence: SequenceId, needed: usize },

    #[error("Unknown sequence {0}")]
    UnknownSequence(SequenceId),

    #[error("Sequence {0} is already registered")]
    AlreadyRegistered(SequenceId),

    #[error("Sequence {0} was evicted")]
    Evicted(SequenceId),

    #[error("Vector length mismatch: {keys} keys, {values} values, dimension {dim}")]
    ShapeMismatch { keys: usize, values: usize, dim: usize },

    #[error("KV input for {0} is non-finite or exceeds magnitude {max:e}", max = quantizer::MAX_MAGNITUDE)]
    UnsupportedValue(SequenceId),

    #[error("Range {start}..{end} is outside {sequence} ({tokens} tokens)")]
    RangeOutOfBounds {
        sequence: SequenceId,
        start: usize,
        end: usize,
        tokens: usize,
    },

    #[error("Cache corruption in {sequence}: {detail}")]
    CacheCorruption { sequence: SequenceId, detail: String },
}

impl CacheError {
    fn corruption(sequence: SequenceId, detail: impl ToString) -> Self {
        let detail = detail.to_string();
        error!(sequence = %sequence, detail = %detail, "Cache corruption detected");
        CacheError::CacheCorruption { sequence, detail }
    }
}

/// Mutable state of one sequence, guarded by its own lock.
#[derive(Debug)]
struct SeqEntry {
    priority: Priority,
    /// Logical token count; always equals the tokens materialized in `pages`.
    tokens: usize,
    /// Page chain in logical order.
    pages: Vec<PageId>,
    /// Set once eviction reclaimed the chain; cleared by `reset_sequence`.
    evicted: bool,
}

#[derive(Debug)]
struct SequenceSlot {
    /// Number of in-flight batches referencing this sequence.
    pins: AtomicU32,
    state: Mutex<SeqEntry>,
}

impl SequenceSlot {
    fn lock(&self) -> MutexGuard<'_, SeqEntry> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Sequence state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DefragReport {
    /// Whether churn had passed the threshold.
    pub ran: bool,
    /// Pages moved to lower ids.
    pub relocated: usize,
    /// Sequences left alone because they were pinned or busy.
    pub skipped_sequences: usize,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub capacity_pages: usize,
    pub pages_in_use: usize,
    pub pages_free: usize,
    pub utilization: f64,
    pub sequences: usize,
    pub pinned_sequences: usize,
    pub evictions: u64,
    pub relocations: u64,
    pub tokens_stored: u64,
    /// Bytes of quantized storage for the stored tokens.
    pub quantized_bytes: u64,
    /// Bytes the same tokens would take at f32.
    pub full_precision_bytes: u64,
}

impl CacheStats {
    /// Memory reduction versus f32 storage.
    pub fn reduction_factor(&self) -> f64 {
        if self.quantized_bytes == 0 {
            return 0.0;
        }
        self.full_precision_bytes as f64 / self.quantized_bytes as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    evictions: AtomicU64,
    relocations: AtomicU64,
}

/// The KV cache manager.
pub struct KvCacheManager {
    sequences: RwLock<HashMap<SequenceId, Arc<SequenceSlot>>>,
    table: RwLock<PageTable>,
    store: PageStore,
    pool: PagePool,
    evictor: Evictor,

    /// Logical clock for last-access stamps.
    clock: AtomicU64,

    counters: Counters,

    /// Sequences evicted since the last `drain_evicted`.
    evicted_log: Mutex<Vec<SequenceId>>,

    /// Serializes compaction passes.
    defrag_lock: Mutex<()>,

    defrag_churn_threshold: u64,
}

impl KvCacheManager {
    pub fn new(cache: &CacheConfig, model: &ModelConfig) -> Self {
        info!(
            capacity = cache.capacity_pages,
            page_tokens = cache.page_tokens,
            kv_dim = model.kv_dim,
            "Initializing KV cache"
        );
        Self {
            sequences: RwLock::new(HashMap::new()),
            table: RwLock::new(PageTable::new(cache.capacity_pages)),
            store: PageStore::new(cache.capacity_pages, cache.page_tokens, model.kv_dim),
            pool: PagePool::new(cache.capacity_pages, cache.acquire),
            evictor: Evictor::new(),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
            evicted_log: Mutex::new(Vec::new()),
            defrag_lock: Mutex::new(()),
            defrag_churn_threshold: cache.defrag_churn_threshold,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn map_read(&self) -> RwLockReadGuard<'_, HashMap<SequenceId, Arc<SequenceSlot>>> {
        self.sequences.read().unwrap_or_else(|p| p.into_inner())
    }

    fn map_write(&self) -> RwLockWriteGuard<'_, HashMap<SequenceId, Arc<SequenceSlot>>> {
        self.sequences.write().unwrap_or_else(|p| p.into_inner())
    }

    fn table_read(&self) -> RwLockReadGuard<'_, PageTable> {
        self.table.read().unwrap_or_else(|p| p.into_inner())
    }

    fn table_write(&self) -> RwLockWriteGuard<'_, PageTable> {
        self.table.write().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, sequence: SequenceId) -> Result<Arc<SequenceSlot>, CacheError> {
        self.map_read()
            .get(&sequence)
            .cloned()
            .ok_or(CacheError::UnknownSequence(sequence))
    }

    fn snapshot(&self) -> Vec<(SequenceId, Arc<SequenceSlot>)> {
        let mut slots: Vec<_> = self
            .map_read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();
        slots.sort_unstable_by_key(|(id, _)| *id);
        slots
    }

    /// Create an empty page chain for a sequence.
    pub fn register(&self, sequence: SequenceId, priority: Priority) -> Result<(), CacheError> {
        let mut map = self.map_write();
        if map.contains_key(&sequence) {
            return Err(CacheError::AlreadyRegistered(sequence));
        }
        map.insert(
            sequence,
            Arc::new(SequenceSlot {
                pins: AtomicU32::new(0),
                state: Mutex::new(SeqEntry {
                    priority,
                    tokens: 0,
                    pages: Vec::new(),
                    evicted: false,
                }),
            }),
        );
        debug!(sequence = %sequence, priority = %priority, "Registered sequence");
        Ok(())
    }

    /// Acquire `count` pages for `sequence`, evicting idle sequences if needed.
    /// All-or-nothing: on failure every page acquired here is returned.
    fn acquire_pages(&self, sequence: SequenceId, count: usize) -> Result<Vec<PageId>, CacheError> {
        // Without blocking nothing else will free pages, so a shortfall that
        // eviction cannot cover must not evict anyone.
        if !self.pool.blocks() && count > self.pool.available() {
            let reachable = self.pool.available() + self.evictable_pages(Some(sequence));
            if reachable < count {
                debug!(sequence = %sequence, needed = count, reachable, "Page request cannot be met");
                return Err(CacheError::OutOfMemory { sequence, needed: count });
            }
        }
        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pool.acquire(sequence, self) {
                Ok(page) => fresh.push(page),
                Err(AllocatorError::OutOfMemory { .. }) => {
                    let needed = count - fresh.len();
                    self.return_pages(sequence, &fresh);
                    debug!(sequence = %sequence, needed, "Page acquisition failed");
                    return Err(CacheError::OutOfMemory { sequence, needed });
                }
                Err(e) => {
                    self.return_pages(sequence, &fresh);
                    return Err(CacheError::corruption(sequence, e));
                }
            }
        }
        Ok(fresh)
    }

    fn return_pages(&self, sequence: SequenceId, pages: &[PageId]) {
        for page in pages {
            self.pool.release(*page, sequence);
        }
    }

    /// Map freshly acquired pages at the end of a chain.
    fn map_pages(
        &self,
        sequence: SequenceId,
        entry: &mut SeqEntry,
        fresh: Vec<PageId>,
        tick: u64,
    ) -> Result<(), CacheError> {
        let base = entry.pages.len();
        let mut table = self.table_write();
        for (i, page) in fresh.iter().enumerate() {
            if let Err(e) = table.insert(sequence, base + i, *page, tick) {
                for mapped in &fresh[..i] {
                    table.remove(*mapped);
                }
                drop(table);
                self.return_pages(sequence, &fresh);
                return Err(CacheError::corruption(sequence, e));
            }
        }
        drop(table);
        for page in &fresh {
            if let Some(mut data) = self.store.lock(*page) {
                data.reset();
            }
        }
        entry.pages.extend(fresh);
        Ok(())
    }

    /// Make sure `sequence` owns at least `pages` pages. Used at admission to
    /// claim room for the prompt before the request is queued.
    pub fn reserve(&self, sequence: SequenceId, pages: usize) -> Result<(), CacheError> {
        let slot = self.slot(sequence)?;
        let mut entry = slot.lock();
        if entry.evicted {
            return Err(CacheError::Evicted(sequence));
        }
        let missing = pages.saturating_sub(entry.pages.len());
        if missing == 0 {
            return Ok(());
        }
        let fresh = self.acquire_pages(sequence, missing)?;
        let tick = self.tick();
        self.map_pages(sequence, &mut entry, fresh, tick)?;
        debug!(sequence = %sequence, pages, "Reserved pages");
        Ok(())
    }

    /// Append key/value vectors for `keys.len() / dim` new tokens.
    ///
    /// Pages are acquired as the sequence crosses page boundaries; either all
    /// tokens are stored or none are.
    pub fn append(&self, sequence: SequenceId, keys: &[f32], values: &[f32]) -> Result<(), CacheError> {
        let dim = self.store.dim();
        if keys.len() != values.len() || keys.len() % dim != 0 {
            return Err(CacheError::ShapeMismatch {
                keys: keys.len(),
                values: values.len(),
                dim,
            });
        }
        if !keys.iter().chain(values).all(|v| quantizer::is_supported(*v)) {
            return Err(CacheError::UnsupportedValue(sequence));
        }
        let new_tokens = keys.len() / dim;
        if new_tokens == 0 {
            return Ok(());
        }

        let slot = self.slot(sequence)?;
        let mut entry = slot.lock();
        if entry.evicted {
            return Err(CacheError::Evicted(sequence));
        }

        let page_tokens = self.store.page_tokens();
        let needed = pages_for_tokens(entry.tokens + new_tokens, page_tokens);
        let missing = needed.saturating_sub(entry.pages.len());
        let tick = self.tick();
        if missing > 0 {
            let fresh = self.acquire_pages(sequence, missing)?;
            self.map_pages(sequence, &mut entry, fresh, tick)?;
        }

        let mut written = 0;
        while written < new_tokens {
            let position = entry.tokens + written;
            let logical = position / page_tokens;
            let offset = position % page_tokens;
            let run = (page_tokens - offset).min(new_tokens - written);
            let elems = written * dim..(written + run) * dim;
            self.write_run(
                sequence,
                entry.pages[logical],
                offset,
                &keys[elems.clone()],
                &values[elems],
                tick,
            )?;
            written += run;
        }
        entry.tokens += new_tokens;
        Ok(())
    }

    /// Quantize a run of tokens into one page starting at token slot `offset`.
    fn write_run(
        &self,
        sequence: SequenceId,
        page: PageId,
        offset: usize,
        keys: &[f32],
        values: &[f32],
        tick: u64,
    ) -> Result<(), CacheError> {
        let dim = self.store.dim();
        let mut table = self.table_write();
        let mut params = table
            .params(page)
            .ok_or_else(|| CacheError::corruption(sequence, PageTableError::NotMapped(page)))?;
        let mut data = self
            .store
            .lock(page)
            .ok_or_else(|| CacheError::corruption(sequence, PageTableError::OutOfRange(page)))?;
        if data.filled != offset {
            return Err(CacheError::corruption(
                sequence,
                format!("{page} holds {} tokens, expected {offset}", data.filled),
            ));
        }
        data.ensure_len(self.store.page_elements());

        let was_empty = data.filled == 0;
        let filled = data.filled * dim;
        let start = offset * dim;
        let end = start + keys.len();

        params.keys = fit_params(&mut data.keys[..filled], params.keys, keys, was_empty);
        params.values = fit_params(&mut data.values[..filled], params.values, values, was_empty);
        quantizer::quantize_into(&mut data.keys[start..end], keys, &params.keys);
        quantizer::quantize_into(&mut data.values[start..end], values, &params.values);
        data.filled = offset + keys.len() / dim;

        table
            .set_params(page, params)
            .map_err(|e| CacheError::corruption(sequence, e))?;
        table.touch(page, tick);
        Ok(())
    }

    /// Dequantize tokens `range` of a sequence.
    pub fn read(&self, sequence: SequenceId, range: Range<usize>) -> Result<KvVectors, CacheError> {
        let slot = self.slot(sequence)?;
        let entry = slot.lock();
        if entry.evicted {
            return Err(CacheError::Evicted(sequence));
        }
        if range.start > range.end || range.end > entry.tokens {
            return Err(CacheError::RangeOutOfBounds {
                sequence,
                start: range.start,
                end: range.end,
                tokens: entry.tokens,
            });
        }

        let dim = self.store.dim();
        let page_tokens = self.store.page_tokens();
        let tick = self.tick();
        let mut out = KvVectors::with_capacity(range.len() * dim);
        let table = self.table_read();

        let mut position = range.start;
        while position < range.end {
            let logical = position / page_tokens;
            let offset = position % page_tokens;
            let run = (page_tokens - offset).min(range.end - position);
            let page = *entry.pages.get(logical).ok_or_else(|| {
                CacheError::corruption(sequence, format!("block {logical} missing from chain"))
            })?;

            if table.lookup(sequence, logical) != Some(page) {
                return Err(CacheError::corruption(
                    sequence,
                    format!("block {logical} does not map to {page}"),
                ));
            }
            let params: PageParams = table
                .params(page)
                .ok_or_else(|| CacheError::corruption(sequence, PageTableError::NotMapped(page)))?;
            let data = self
                .store
                .lock(page)
                .ok_or_else(|| CacheError::corruption(sequence, PageTableError::OutOfRange(page)))?;
            if data.filled < offset + run {
                return Err(CacheError::corruption(
                    sequence,
                    format!("{page} holds {} tokens, read needs {}", data.filled, offset + run),
                ));
            }
            let elems = offset * dim..(offset + run) * dim;
            quantizer::dequantize_into(&mut out.keys, &data.keys[elems.clone()], &params.keys);
            quantizer::dequantize_into(&mut out.values, &data.values[elems], &params.values);
            table.touch(page, tick);
            position += run;
        }
        Ok(out)
    }

    /// Evict the idle sequence whose least-recently-used page is oldest,
    /// reclaiming all of its pages. Pinned sequences are never candidates.
    pub fn evict_one(&self) -> Option<SequenceId> {
        self.evict_excluding(None)
    }

    fn evict_excluding(&self, requester: Option<SequenceId>) -> Option<SequenceId> {
        let slots = self.snapshot();
        let protected: Vec<SequenceId> = requester.into_iter().collect();

        let mut candidates = Vec::new();
        for (id, slot) in &slots {
            if slot.is_pinned() || Some(*id) == requester {
                continue;
            }
            let Ok(entry) = slot.state.try_lock() else {
                continue;
            };
            if entry.pages.is_empty() {
                continue;
            }
            let oldest_access = self.table_read().oldest_access(&entry.pages).unwrap_or(0);
            candidates.push(EvictionCandidate {
                sequence_id: *id,
                oldest_access,
                pages: entry.pages.len(),
            });
        }

        for candidate in self.evictor.rank(candidates, &protected) {
            let Some((_, slot)) = slots.iter().find(|(id, _)| *id == candidate.sequence_id) else {
                continue;
            };
            // Pins are taken under the state lock, so this check is stable
            // for as long as the guard is held.
            let Ok(mut entry) = slot.state.try_lock() else {
                continue;
            };
            if slot.is_pinned() || entry.pages.is_empty() {
                continue;
            }

            let victim = candidate.sequence_id;
            let freed = self.reclaim_chain(victim, &mut entry);
            entry.tokens = 0;
            entry.evicted = true;
            drop(entry);

            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.evicted_log
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(victim);
            info!(
                sequence = %victim,
                freed,
                oldest_access = candidate.oldest_access,
                "Evicted sequence"
            );
            return Some(victim);
        }
        None
    }

    /// Unmap and free a whole chain, oldest-access pages first.
    fn reclaim_chain(&self, sequence: SequenceId, entry: &mut SeqEntry) -> usize {
        let mut table = self.table_write();
        let aged: Vec<(PageId, u64)> = entry
            .pages
            .iter()
            .map(|p| (*p, table.last_access(*p).unwrap_or(0)))
            .collect();
        let order = self.evictor.reclaim_order(aged);

        let mut freed = 0;
        for page in order {
            if table.remove(page).is_none() {
                warn!(sequence = %sequence, page = %page, "Reclaiming unmapped page");
            }
            if let Some(mut data) = self.store.lock(page) {
                data.reset();
            }
            if self.pool.release(page, sequence) {
                freed += 1;
            }
        }
        entry.pages.clear();
        freed
    }

    /// Mark a sequence as referenced by an in-flight batch.
    pub fn pin(&self, sequence: SequenceId) -> Result<(), CacheError> {
        let slot = self.slot(sequence)?;
        let entry = slot.lock();
        if entry.evicted {
            return Err(CacheError::Evicted(sequence));
        }
        slot.pins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn unpin(&self, sequence: SequenceId) {
        if let Ok(slot) = self.slot(sequence) {
            let _ = slot
                .pins
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    pub fn is_pinned(&self, sequence: SequenceId) -> bool {
        self.slot(sequence).map(|s| s.is_pinned()).unwrap_or(false)
    }

    /// Free every page of a sequence and forget it. Returns pages freed.
    pub fn release_sequence(&self, sequence: SequenceId) -> usize {
        let Some(slot) = self.map_write().remove(&sequence) else {
            return 0;
        };
        let mut entry = slot.lock();
        let freed = self.reclaim_chain(sequence, &mut entry);
        entry.tokens = 0;
        debug!(sequence = %sequence, freed, "Released sequence");
        freed
    }

    /// Drop all pages and clear the evicted mark so the sequence can be
    /// recomputed from scratch.
    pub fn reset_sequence(&self, sequence: SequenceId) -> Result<usize, CacheError> {
        let slot = self.slot(sequence)?;
        let mut entry = slot.lock();
        let freed = self.reclaim_chain(sequence, &mut entry);
        entry.tokens = 0;
        entry.evicted = false;
        Ok(freed)
    }

    /// Check that a sequence's chain agrees with the page table and pool.
    pub fn verify(&self, sequence: SequenceId) -> Result<(), CacheError> {
        let slot = self.slot(sequence)?;
        let entry = slot.lock();
        let page_tokens = self.store.page_tokens();
        if pages_for_tokens(entry.tokens, page_tokens) > entry.pages.len() {
            return Err(CacheError::corruption(
                sequence,
                format!("{} tokens on {} pages", entry.tokens, entry.pages.len()),
            ));
        }
        let table = self.table_read();
        let mut materialized = 0;
        for (logical, page) in entry.pages.iter().enumerate() {
            if table.lookup(sequence, logical) != Some(*page) {
                return Err(CacheError::corruption(
                    sequence,
                    format!("block {logical} does not map to {page}"),
                ));
            }
            if self.pool.owner_of(*page) != Some(sequence) {
                return Err(CacheError::corruption(
                    sequence,
                    format!("{page} is not owned by the sequence"),
                ));
            }
            if let Some(data) = self.store.lock(*page) {
                materialized += data.filled;
            }
        }
        if materialized != entry.tokens {
            return Err(CacheError::corruption(
                sequence,
                format!("{} tokens recorded, {materialized} materialized", entry.tokens),
            ));
        }
        Ok(())
    }

    /// Take the list of sequences evicted since the last call.
    pub fn drain_evicted(&self) -> Vec<SequenceId> {
        std::mem::take(&mut *self.evicted_log.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Pages eviction could free right now, excluding `requester`.
    /// Busy sequences are counted as not evictable.
    pub fn evictable_pages(&self, requester: Option<SequenceId>) -> usize {
        self.snapshot()
            .iter()
            .filter(|(id, slot)| Some(*id) != requester && !slot.is_pinned())
            .filter_map(|(_, slot)| slot.state.try_lock().ok().map(|e| e.pages.len()))
            .sum()
    }

    /// Relocate live, unpinned pages into the lowest free page ids once
    /// free-list churn has passed the configured threshold.
    pub fn defragment(&self) -> DefragReport {
        let _serial = self.defrag_lock.lock().unwrap_or_else(|p| p.into_inner());
        let churn = self.pool.churn();
        if churn < self.defrag_churn_threshold {
            return DefragReport::default();
        }

        let mut report = DefragReport {
            ran: true,
            ..Default::default()
        };
        let mut free: VecDeque<PageId> = self.pool.free_pages_sorted().into();

        for (id, slot) in self.snapshot() {
            let Ok(mut entry) = slot.state.try_lock() else {
                report.skipped_sequences += 1;
                continue;
            };
            if slot.is_pinned() {
                report.skipped_sequences += 1;
                continue;
            }
            for logical in 0..entry.pages.len() {
                let from = entry.pages[logical];
                let Some(&to) = free.front() else { break };
                if to >= from {
                    continue;
                }
                free.pop_front();
                match self.relocate_page(id, from, to) {
                    Ok(()) => {
                        entry.pages[logical] = to;
                        report.relocated += 1;
                        let pos = free.partition_point(|p| *p < from);
                        free.insert(pos, from);
                    }
                    Err(e) => debug!(sequence = %id, page = %from, error = %e, "Skipped relocation"),
                }
            }
        }

        self.pool.compact_free_list();
        self.pool.reset_churn();
        self.counters
            .relocations
            .fetch_add(report.relocated as u64, Ordering::Relaxed);
        info!(
            churn,
            relocated = report.relocated,
            skipped = report.skipped_sequences,
            "Defragmentation complete"
        );
        report
    }

    fn relocate_page(&self, sequence: SequenceId, from: PageId, to: PageId) -> Result<(), CacheError> {
        let mut table = self.table_write();
        self.pool
            .relocate(from, to, sequence)
            .map_err(|e| CacheError::CacheCorruption {
                sequence,
                detail: e.to_string(),
            })?;
        if let (Some(src), Some(mut dst)) = (self.store.lock(from), self.store.lock(to)) {
            dst.copy_from(&src);
        }
        if let Some(mut src) = self.store.lock(from) {
            src.reset();
        }
        table
            .move_page(from, to)
            .map_err(|e| CacheError::corruption(sequence, e))
    }

    /// Logical token count of a sequence.
    pub fn tokens(&self, sequence: SequenceId) -> Result<usize, CacheError> {
        Ok(self.slot(sequence)?.lock().tokens)
    }

    /// Pages currently owned by a sequence.
    pub fn page_count(&self, sequence: SequenceId) -> Result<usize, CacheError> {
        Ok(self.slot(sequence)?.lock().pages.len())
    }

    pub fn priority(&self, sequence: SequenceId) -> Result<Priority, CacheError> {
        Ok(self.slot(sequence)?.lock().priority)
    }

    pub fn is_evicted(&self, sequence: SequenceId) -> bool {
        self.slot(sequence).map(|s| s.lock().evicted).unwrap_or(false)
    }

    pub fn contains(&self, sequence: SequenceId) -> bool {
        self.map_read().contains_key(&sequence)
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn page_tokens(&self) -> usize {
        self.store.page_tokens()
    }

    pub fn dim(&self) -> usize {
        self.store.dim()
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.snapshot();
        let mut tokens_stored = 0u64;
        let mut pinned = 0;
        for (_, slot) in &slots {
            if slot.is_pinned() {
                pinned += 1;
            }
            if let Ok(entry) = slot.state.try_lock() {
                tokens_stored += entry.tokens as u64;
            }
        }
        // K and V, one byte per element
        let quantized_bytes = tokens_stored * self.store.dim() as u64 * 2;
        CacheStats {
            capacity_pages: self.pool.capacity(),
            pages_in_use: self.pool.in_use(),
            pages_free: self.pool.available(),
            utilization: self.pool.utilization(),
            sequences: slots.len(),
            pinned_sequences: pinned,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            relocations: self.counters.relocations.load(Ordering::Relaxed),
            tokens_stored,
            quantized_bytes,
            full_precision_bytes: quantized_bytes * std::mem::size_of::<f32>() as u64,
        }
    }
}

impl Reclaimer for KvCacheManager {
    fn reclaim(&self, requester: Option<SequenceId>) -> bool {
        self.evict_excluding(requester).is_some()
    }
}

/// Parameters covering `incoming`, requantizing `existing` codes if the page's
/// range has to grow.
fn fit_params(existing: &mut [u8], current: QuantParams, incoming: &[f32], was_empty: bool) -> QuantParams {
    let Some((lo, hi)) = quantizer::value_range(incoming) else {
        return current;
    };
    if !was_empty && current.covers(lo, hi) {
        return current;
    }
    let next = current.widened(lo, hi, was_empty);
    if !was_empty {
        quantizer::requantize(existing, &current, &next);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquireMode;

    const DIM: usize = 4;

    fn manager(capacity: usize) -> KvCacheManager {
        let cache = CacheConfig {
            page_tokens: 16,
            capacity_pages: capacity,
            acquire: AcquireMode::FailFast,
            defrag_churn_threshold: 0,
            defrag_interval_ms: 0,
        };
        let model = ModelConfig {
            context_window: 4096,
            kv_dim: DIM,
        };
        KvCacheManager::new(&cache, &model)
    }

    fn kv(tokens: usize, seed: f32) -> (Vec<f32>, Vec<f32>) {
        let keys = (0..tokens * DIM).map(|i| (i as f32 * 0.1 + seed).sin()).collect();
        let values = (0..tokens * DIM).map(|i| (i as f32 * 0.2 + seed).cos() * 2.0).collect();
        (keys, values)
    }

    fn fill(mgr: &KvCacheManager, id: u64, tokens: usize) -> SequenceId {
        let seq = SequenceId(id);
        mgr.register(seq, Priority::Normal).unwrap();
        let (k, v) = kv(tokens, id as f32);
        mgr.append(seq, &k, &v).unwrap();
        seq
    }

    #[test]
    fn test_append_allocates_pages_at_boundaries() {
        let mgr = manager(8);
        let seq = fill(&mgr, 1, 16);
        assert_eq!(mgr.page_count(seq).unwrap(), 1);

        let (k, v) = kv(1, 0.5);
        mgr.append(seq, &k, &v).unwrap();
        assert_eq!(mgr.page_count(seq).unwrap(), 2);
        assert_eq!(mgr.tokens(seq).unwrap(), 17);
        mgr.verify(seq).unwrap();
    }

    #[test]
    fn test_read_round_trip_within_bound() {
        let mgr = manager(8);
        let seq = SequenceId(1);
        mgr.register(seq, Priority::Normal).unwrap();

        // Appended in small chunks so pages get requantized as ranges grow.
        let (k, v) = kv(40, 0.0);
        for chunk in 0..10 {
            let r = chunk * 4 * DIM..(chunk + 1) * 4 * DIM;
            mgr.append(seq, &k[r.clone()], &v[r]).unwrap();
        }

        let out = mgr.read(seq, 0..40).unwrap();
        assert_eq!(out.keys.len(), 40 * DIM);
        // Ranges are within [-2, 2]; after at most a few doublings the
        // scale stays small.
        for (a, b) in k.iter().zip(out.keys.iter()) {
            assert!((a - b).abs() < 0.05, "key {a} read back as {b}");
        }
        for (a, b) in v.iter().zip(out.values.iter()) {
            assert!((a - b).abs() < 0.1, "value {a} read back as {b}");
        }
    }

    #[test]
    fn test_read_out_of_range() {
        let mgr = manager(4);
        let seq = fill(&mgr, 1, 10);
        assert!(matches!(
            mgr.read(seq, 5..11),
            Err(CacheError::RangeOutOfBounds { tokens: 10, .. })
        ));
    }

    #[test]
    fn test_append_is_all_or_nothing() {
        let mgr = manager(2);
        let seq = SequenceId(1);
        mgr.register(seq, Priority::Normal).unwrap();

        let (k, v) = kv(48, 0.0); // needs 3 pages
        let err = mgr.append(seq, &k, &v).unwrap_err();
        assert!(matches!(err, CacheError::OutOfMemory { .. }));
        assert_eq!(mgr.tokens(seq).unwrap(), 0);
        assert_eq!(mgr.pool().in_use(), 0);
    }

    #[test]
    fn test_shape_and_nan_rejected() {
        let mgr = manager(2);
        let seq = SequenceId(1);
        mgr.register(seq, Priority::Normal).unwrap();
        assert!(matches!(
            mgr.append(seq, &[1.0; 3], &[1.0; 3]),
            Err(CacheError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            mgr.append(seq, &[f32::NAN; 4], &[1.0; 4]),
            Err(CacheError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn test_append_rejects_values_past_max_magnitude() {
        let mgr = manager(2);
        let seq = SequenceId(1);
        mgr.register(seq, Priority::Normal).unwrap();
        let huge = [-3e38, 3e38, 0.0, 1.0];
        assert!(matches!(
            mgr.append(seq, &huge, &[1.0; 4]),
            Err(CacheError::UnsupportedValue(s)) if s == seq
        ));
        assert_eq!(mgr.tokens(seq).unwrap(), 0);
        assert_eq!(mgr.pool().in_use(), 0);

        let m = quantizer::MAX_MAGNITUDE;
        let edge = [-m, m, 0.0, m / 2.0];
        mgr.append(seq, &edge, &edge).unwrap();
        let back = mgr.read(seq, 0..1).unwrap();
        let step = 2.0 * m / 255.0;
        for (v, b) in edge.iter().zip(back.keys.iter()) {
            assert!(b.is_finite());
            assert!((v - b).abs() <= step);
        }
    }

    #[test]
    fn test_evict_picks_oldest_lru() {
        let mgr = manager(8);
        let old = fill(&mgr, 1, 32);
        let young = fill(&mgr, 2, 32);

        assert_eq!(mgr.evict_one(), Some(old));
        assert!(mgr.is_evicted(old));
        assert_eq!(mgr.tokens(old).unwrap(), 0);
        assert_eq!(mgr.page_count(young).unwrap(), 2);
        assert_eq!(mgr.drain_evicted(), vec![old]);
        assert!(mgr.drain_evicted().is_empty());
    }

    #[test]
    fn test_read_refreshes_lru() {
        let mgr = manager(8);
        let first = fill(&mgr, 1, 16);
        let second = fill(&mgr, 2, 16);

        mgr.read(first, 0..16).unwrap();
        assert_eq!(mgr.evict_one(), Some(second));
    }

    #[test]
    fn test_pinned_never_evicted() {
        let mgr = manager(4);
        let seq = fill(&mgr, 1, 16);
        mgr.pin(seq).unwrap();
        assert_eq!(mgr.evict_one(), None);

        mgr.unpin(seq);
        assert_eq!(mgr.evict_one(), Some(seq));
        assert!(matches!(mgr.pin(seq), Err(CacheError::Evicted(_))));
    }

    #[test]
    fn test_append_evicts_idle_sequence() {
        let mgr = manager(2);
        let idle = fill(&mgr, 1, 32);
        let grower = SequenceId(2);
        mgr.register(grower, Priority::Normal).unwrap();

        let (k, v) = kv(16, 1.0);
        mgr.append(grower, &k, &v).unwrap();
        assert!(mgr.is_evicted(idle));
        assert_eq!(mgr.page_count(grower).unwrap(), 1);
    }

    #[test]
    fn test_requester_never_evicts_itself() {
        let mgr = manager(1);
        let seq = fill(&mgr, 1, 16);
        let (k, v) = kv(1, 0.0);
        assert!(matches!(
            mgr.append(seq, &k, &v),
            Err(CacheError::OutOfMemory { .. })
        ));
        assert!(!mgr.is_evicted(seq));
        assert_eq!(mgr.tokens(seq).unwrap(), 16);
    }

    #[test]
    fn test_release_returns_pages() {
        let mgr = manager(4);
        let seq = fill(&mgr, 1, 40);
        assert_eq!(mgr.pool().in_use(), 3);
        assert_eq!(mgr.release_sequence(seq), 3);
        assert_eq!(mgr.pool().in_use(), 0);
        assert!(!mgr.contains(seq));
        assert_eq!(mgr.release_sequence(seq), 0);
    }

    #[test]
    fn test_reserve_then_append_uses_reserved_pages() {
        let mgr = manager(4);
        let seq = SequenceId(1);
        mgr.register(seq, Priority::High).unwrap();
        mgr.reserve(seq, 2).unwrap();
        assert_eq!(mgr.pool().in_use(), 2);

        let (k, v) = kv(20, 0.0);
        mgr.append(seq, &k, &v).unwrap();
        assert_eq!(mgr.pool().in_use(), 2);
        mgr.verify(seq).unwrap();
    }

    #[test]
    fn test_defragment_moves_pages_low_and_skips_pinned() {
        let mgr = manager(6);
        let a = fill(&mgr, 1, 32); // pages 0, 1
        let b = fill(&mgr, 2, 32); // pages 2, 3
        let c = fill(&mgr, 3, 32); // pages 4, 5
        mgr.release_sequence(a);
        mgr.pin(b).unwrap();

        let before = mgr.read(c, 0..32).unwrap();
        let report = mgr.defragment();
        assert!(report.ran);
        assert_eq!(report.relocated, 2);
        assert_eq!(report.skipped_sequences, 1);

        assert_eq!(mgr.read(c, 0..32).unwrap(), before);
        assert_eq!(mgr.pool().owner_of(PageId(0)), Some(c));
        assert_eq!(mgr.pool().owner_of(PageId(2)), Some(b));
        mgr.verify(b).unwrap();
        mgr.verify(c).unwrap();
    }

    #[test]
    fn test_defragment_waits_for_churn() {
        let cache = CacheConfig {
            defrag_churn_threshold: 1_000,
            ..CacheConfig::default()
        };
        let mgr = KvCacheManager::new(&cache, &ModelConfig::default());
        assert!(!mgr.defragment().ran);
    }

    #[test]
    fn test_stats_reduction_factor() {
        let mgr = manager(4);
        fill(&mgr, 1, 20);
        let stats = mgr.stats();
        assert_eq!(stats.tokens_stored, 20);
        assert_eq!(stats.pages_in_use, 2);
        assert!((stats.reduction_factor() - 4.0).abs() < 1e-9);
    }
}
