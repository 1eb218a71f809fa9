//! LRU cache of prompt KV for prefix reuse.
//!
//! Entries are keyed by a hash of the prompt's token ids and hold the
//! dequantized KV for those tokens. A lookup finds the longest cached entry
//! that is a prefix of the incoming prompt; only lengths that actually exist
//! in the cache are hashed. Token ids are compared on every hit, so a hash
//! collision is a miss and never wrong KV.
//!
//! The cache is bounded by entry count and by bytes of stored vectors; the
//! least recently used entry goes first when either bound is hit.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cache::page::KvVectors;

#[derive(Debug)]
struct CachedPrompt {
    tokens: Arc<[u32]>,
    kv: KvVectors,
    last_used: u64,
}

impl CachedPrompt {
    fn bytes(&self) -> usize {
        (self.kv.keys.len() + self.kv.values.len()) * std::mem::size_of::<f32>()
    }
}

/// Prompt cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptCacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_tokens: u64,
}

/// Bounded LRU map from prompt token ids to their KV.
#[derive(Debug)]
pub struct PromptCache {
    entries: HashMap<u64, CachedPrompt>,

    /// Number of cached entries of each prompt length.
    lengths: BTreeMap<usize, usize>,

    max_entries: usize,
    max_bytes: usize,
    bytes: usize,
    clock: u64,
    hits: u64,
    misses: u64,
    hit_tokens: u64,
}

fn hash_tokens(tokens: &[u32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    tokens.hash(&mut hasher);
    hasher.finish()
}

impl PromptCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries),
            lengths: BTreeMap::new(),
            max_entries,
            max_bytes,
            bytes: 0,
            clock: 0,
            hits: 0,
            misses: 0,
            hit_tokens: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Store the KV of `tokens`, replacing an older entry for the same
    /// prompt. Entries larger than the byte bound are not kept.
    pub fn insert(&mut self, tokens: &[u32], kv: KvVectors) {
        if tokens.is_empty() || self.max_entries == 0 {
            return;
        }
        let key = hash_tokens(tokens);
        self.remove(key);

        let entry = CachedPrompt {
            tokens: tokens.into(),
            kv,
            last_used: self.tick(),
        };
        let size = entry.bytes();
        if size > self.max_bytes {
            debug!(tokens = tokens.len(), size, "Prompt too large to cache");
            return;
        }
        while self.entries.len() >= self.max_entries || self.bytes + size > self.max_bytes {
            if !self.evict_lru() {
                break;
            }
        }

        self.bytes += size;
        *self.lengths.entry(tokens.len()).or_insert(0) += 1;
        self.entries.insert(key, entry);
    }

    /// KV of exactly `tokens`, if cached.
    pub fn get(&mut self, tokens: &[u32]) -> Option<&KvVectors> {
        let key = hash_tokens(tokens);
        let now = self.tick();
        match self.entries.get_mut(&key) {
            Some(entry) if *entry.tokens == *tokens => {
                entry.last_used = now;
                self.hits += 1;
                self.hit_tokens += tokens.len() as u64;
                Some(&entry.kv)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Longest cached prefix of `tokens`: its length and a copy of its KV.
    pub fn find_prefix(&mut self, tokens: &[u32]) -> Option<(usize, KvVectors)> {
        if tokens.is_empty() {
            return None;
        }
        let candidates: Vec<usize> = self.lengths.range(1..=tokens.len()).rev().map(|(len, _)| *len).collect();
        let now = self.tick();
        for len in candidates {
            let prefix = &tokens[..len];
            if let Some(entry) = self.entries.get_mut(&hash_tokens(prefix)) {
                if *entry.tokens == *prefix {
                    entry.last_used = now;
                    self.hits += 1;
                    self.hit_tokens += len as u64;
                    return Some((len, entry.kv.clone()));
                }
            }
        }
        self.misses += 1;
        None
    }

    fn remove(&mut self, key: u64) -> bool {
        let Some(entry) = self.entries.remove(&key) else {
            return false;
        };
        self.bytes -= entry.bytes();
        let len = entry.tokens.len();
        if let Some(count) = self.lengths.get_mut(&len) {
            *count -= 1;
            if *count == 0 {
                self.lengths.remove(&len);
            }
        }
        true
    }

    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| *k);
        match oldest {
            Some(key) => self.remove(key),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lengths.clear();
        self.bytes = 0;
    }

    pub fn stats(&self) -> PromptCacheStats {
        PromptCacheStats {
            entries: self.entries.len(),
            bytes: self.bytes,
            hits: self.hits,
            misses: self.misses,
            hit_tokens: self.hit_tokens,
        }
    }
}
