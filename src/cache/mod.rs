//! Paged, quantized KV cache.
//!
//! This module contains the cache data structures and algorithms:
//! - [`allocator`]: Fixed-capacity page pool with an owner-checked free list
//! - [`page`]: Page ids, page contents and the page arena
//! - [`page_table`]: (sequence, block) → page mapping and per-page metadata
//! - [`quantizer`]: Per-page 8-bit quantization (scale + zero point)
//! - [`evictor`]: Victim ranking (oldest LRU page first)
//! - [`prompt_cache`]: LRU prompt KV kept for prefix reuse
//! - [`manager`]: The KV cache manager tying it all together

pub mod allocator;
pub mod evictor;
pub mod manager;
pub mod page;
pub mod page_table;
pub mod prompt_cache;
pub mod quantizer;

pub use allocator::{AllocatorError, PagePool, Reclaimer};
pub use manager::{CacheError, CacheStats, DefragReport, KvCacheManager};
pub use page::{KvVectors, PageId};
pub use prompt_cache::{PromptCache, PromptCacheStats};
