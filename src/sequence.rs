//! Sequence and request types shared by the cache and the scheduler.
//!
//! A request wraps exactly one sequence, so both are addressed by the same
//! [`SequenceId`]. The cache only ever sees the id and the priority; the
//! scheduler sees the full [`Request`].

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Unique identifier for a sequence (and the request that owns it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Requests and sequences are one-to-one.
pub use self::SequenceId as RequestId;

/// Priority tier. Lower numeric level is more urgent and pops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Numeric tier level (0 = most urgent).
    pub fn level(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Tier for a numeric level, clamping anything past the last tier to `Low`.
    pub fn from_level(level: u8) -> Priority {
        match level {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    /// The next more urgent tier, or None if already at the top.
    pub fn boost(&self) -> Option<Priority> {
        match self {
            Priority::Critical => None,
            Priority::High => Some(Priority::Critical),
            Priority::Normal => Some(Priority::High),
            Priority::Low => Some(Priority::Normal),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    Queued,
    Batched,
    Running,
    Completed,
    Evicted,
    Failed,
    Cancelled,
}

impl SequenceState {
    /// Whether the sequence has reached a state it never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Completed | SequenceState::Failed | SequenceState::Cancelled
        )
    }
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SequenceState::Queued => "queued",
            SequenceState::Batched => "batched",
            SequenceState::Running => "running",
            SequenceState::Completed => "completed",
            SequenceState::Evicted => "evicted",
            SequenceState::Failed => "failed",
            SequenceState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What kind of work the request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Generate,
    Classify,
    Embed,
}

/// An inference request as delivered by the transport layer.
///
/// The transport has already tokenized and authenticated it; the core only
/// needs sizes and scheduling parameters.
#[derive(Debug, Clone)]
pub struct Request {
    /// Kind of work.
    pub kind: RequestKind,

    /// Scheduling tier.
    pub priority: Priority,

    /// Number of prompt tokens to prefill.
    pub prompt_tokens: usize,

    /// Maximum number of new tokens to generate (0 for classify/embed).
    pub max_tokens: usize,

    /// Whether the caller consumes tokens as a stream.
    pub streaming: bool,

    /// Prompt token ids, when the transport shares them. Enables prefix
    /// reuse through the prompt cache; must hold `prompt_tokens` ids.
    pub prompt_ids: Option<Arc<[u32]>>,

    /// Requests still queued past their deadline are dropped at dequeue time.
    pub deadline: Option<Instant>,
}

impl Request {
    /// A generation request with normal priority.
    pub fn generate(prompt_tokens: usize, max_tokens: usize) -> Self {
        Self {
            kind: RequestKind::Generate,
            priority: Priority::Normal,
            prompt_tokens,
            max_tokens,
            streaming: false,
            prompt_ids: None,
            deadline: None,
        }
    }

    /// A single-pass request (classification or embedding) over the prompt.
    pub fn single_pass(kind: RequestKind, prompt_tokens: usize) -> Self {
        Self {
            kind,
            priority: Priority::Normal,
            prompt_tokens,
            max_tokens: 0,
            streaming: false,
            prompt_ids: None,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Attach prompt token ids; the prompt length follows them.
    pub fn with_prompt_ids(mut self, ids: impl Into<Arc<[u32]>>) -> Self {
        let ids = ids.into();
        self.prompt_tokens = ids.len();
        self.prompt_ids = Some(ids);
        self
    }

    /// Total tokens the sequence will hold once finished.
    pub fn target_tokens(&self) -> usize {
        self.prompt_tokens + self.max_tokens
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() > d)
    }
}

/// Number of pages needed to hold `tokens` tokens.
pub fn pages_for_tokens(tokens: usize, page_tokens: usize) -> usize {
    if page_tokens == 0 {
        return 0;
    }
    tokens.div_ceil(page_tokens)
}
