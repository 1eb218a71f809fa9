//! Page types and the page arena.
//!
//! A page holds a fixed number of token slots of quantized key and value
//! data. Pages live in a fixed arena indexed by [`PageId`]; sequences refer to
//! pages by id only, so moving a page between owners is a pure data operation.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::cache::quantizer::QuantParams;

/// Index of a physical page in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// Flattened key/value vectors for a run of tokens.
///
/// `keys` and `values` each hold `tokens * dim` elements, token-major.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvVectors {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
}

impl KvVectors {
    pub fn with_capacity(elements: usize) -> Self {
        Self {
            keys: Vec::with_capacity(elements),
            values: Vec::with_capacity(elements),
        }
    }

    /// Number of tokens, given the per-token vector dimension.
    pub fn token_count(&self, dim: usize) -> usize {
        if dim == 0 {
            return 0;
        }
        self.keys.len() / dim
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Quantized contents of one page.
#[derive(Debug, Default)]
pub struct PageData {
    /// Quantized keys, `page_tokens * dim` bytes once first written.
    pub keys: Vec<u8>,

    /// Quantized values, same layout as `keys`.
    pub values: Vec<u8>,

    /// Number of token slots written.
    pub filled: usize,
}

impl PageData {
    /// Make sure the buffers cover a full page.
    pub fn ensure_len(&mut self, elements: usize) {
        if self.keys.len() != elements {
            self.keys.resize(elements, 0);
            self.values.resize(elements, 0);
        }
    }

    /// Forget contents; buffers are kept for reuse.
    pub fn reset(&mut self) {
        self.filled = 0;
    }

    /// Copy contents from another page.
    pub fn copy_from(&mut self, other: &PageData) {
        self.keys.clone_from(&other.keys);
        self.values.clone_from(&other.values);
        self.filled = other.filled;
    }
}

/// Per-page metadata tracked by the page table.
#[derive(Debug, Clone, Copy)]
pub struct PageParams {
    /// Quantization parameters for the key half.
    pub keys: QuantParams,
    /// Quantization parameters for the value half.
    pub values: QuantParams,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            keys: QuantParams::EMPTY,
            values: QuantParams::EMPTY,
        }
    }
}

/// Fixed arena of page slots, each independently guarded.
pub struct PageStore {
    slots: Box<[Mutex<PageData>]>,
    page_tokens: usize,
    dim: usize,
}

impl PageStore {
    /// Create an arena of `capacity` pages. Buffers are allocated on first write.
    pub fn new(capacity: usize, page_tokens: usize, dim: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(PageData::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            page_tokens,
            dim,
        }
    }

    /// Lock one slot. A poisoned slot is recovered; its contents are
    /// revalidated by the page table.
    pub fn lock(&self, id: PageId) -> Option<MutexGuard<'_, PageData>> {
        let slot = self.slots.get(id.index())?;
        Some(slot.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(page = %id, "Page slot mutex poisoned, recovering");
            poisoned.into_inner()
        }))
    }

    /// Elements per half (keys or values) of a full page.
    pub fn page_elements(&self) -> usize {
        self.page_tokens * self.dim
    }

    pub fn page_tokens(&self) -> usize {
        self.page_tokens
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
