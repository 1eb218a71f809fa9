//! Runtime configuration for kv-cache-sched.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All pool, cache, scheduling and admission knobs live here. Presets only
//! rewrite budgets and worker counts; there is a single execution path.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequence::pages_for_tokens;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kv-cache-sched",
    about = "Admission-controlled scheduler with a paged, quantized KV cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Ops HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Budget preset applied on top of the config file.
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,

    /// Submit this many synthetic requests at startup.
    #[arg(long, default_value_t = 0)]
    pub demo_requests: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} ({value}) must not exceed {limit_name} ({limit})")]
    Exceeds {
        field: &'static str,
        value: usize,
        limit_name: &'static str,
        limit: usize,
    },

    #[error("tuning bounds are inverted: min {min} > max {max}")]
    InvertedTuningBounds { min: usize, max: usize },
}

/// Budget presets. They differ only in numbers fed to the pool, batch former
/// and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Small batches, fewer workers, short queues.
    Latency,
    /// Large batches, more workers, deep queues.
    Throughput,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ops server configuration.
    pub server: ServerConfig,

    /// Per-model constants supplied by the model registry.
    pub model: ModelConfig,

    /// Page pool and KV cache settings.
    pub cache: CacheConfig,

    /// Batch formation settings.
    pub scheduler: SchedulerConfig,

    /// Worker pool settings.
    pub workers: WorkerConfig,

    /// Admission control settings.
    pub admission: AdmissionConfig,
}

/// Ops HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:9090").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Immutable model constants, fixed for the runtime's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context window in tokens.
    pub context_window: usize,

    /// Elements per key (and per value) vector for one token.
    pub kv_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_window: 4096,
            kv_dim: 128,
        }
    }
}

/// How `acquire` behaves when the pool is exhausted and eviction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AcquireMode {
    /// Return `OutOfMemory` immediately.
    FailFast,
    /// Wait up to `timeout_ms` for another caller to release a page.
    Block { timeout_ms: u64 },
}

impl AcquireMode {
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            AcquireMode::FailFast => None,
            AcquireMode::Block { timeout_ms } => Some(Duration::from_millis(*timeout_ms)),
        }
    }
}

/// Page pool and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Token slots per page.
    pub page_tokens: usize,

    /// Total pages in the pool.
    pub capacity_pages: usize,

    /// Exhaustion behaviour of `acquire`.
    pub acquire: AcquireMode,

    /// Acquire/release operations since the last compaction before
    /// `defragment` does any work.
    pub defrag_churn_threshold: u64,

    /// Interval of the background compaction task (0 disables it).
    pub defrag_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_tokens: 16,
            capacity_pages: 1024,
            acquire: AcquireMode::FailFast,
            defrag_churn_threshold: 512,
            defrag_interval_ms: 1000,
        }
    }
}

/// Adaptive token-budget tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Apply the tuner after every batch cycle.
    pub enabled: bool,

    /// Batch latency the tuner steers towards.
    pub target_latency_ms: u64,

    /// Lower bound of the tuned token budget.
    pub min_token_budget: usize,

    /// Upper bound of the tuned token budget.
    pub max_token_budget: usize,

    /// Fractional change applied per adjustment.
    pub step_fraction: f64,

    /// Smoothing factor of the latency moving average.
    pub ewma_alpha: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_latency_ms: 50,
            min_token_budget: 256,
            max_token_budget: 8192,
            step_fraction: 0.25,
            ewma_alpha: 0.3,
        }
    }
}

/// Batch formation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tokens processed by one batch.
    pub token_budget: usize,

    /// Maximum pages newly claimed by one batch.
    pub memory_budget_pages: usize,

    /// Maximum sequences per batch.
    pub max_batch_size: usize,

    /// Tokens generated per sequence per decode step.
    pub decode_chunk: usize,

    /// Consecutive deferrals before a request's tier is boosted (K).
    pub deferral_boost_after: u32,

    /// Maximum number of tier levels a request can be boosted.
    pub max_priority_boost: u8,

    /// A waiting tier is served within this many scheduling rounds (R).
    pub starvation_rounds: u32,

    /// Dispatcher poll interval when there is nothing to schedule.
    pub tick_ms: u64,

    /// Adaptive budget tuning.
    pub tuning: TuningConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            token_budget: 2048,
            memory_budget_pages: 256,
            max_batch_size: 16,
            decode_chunk: 16,
            deferral_boost_after: 3,
            max_priority_boost: 2,
            starvation_rounds: 8,
            tick_ms: 2,
            tuning: TuningConfig::default(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Backend calls running longer than this fail the batch.
    pub execute_timeout_ms: u64,

    /// Batches queued per worker before the dispatcher holds back.
    pub local_queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            execute_timeout_ms: 30_000,
            local_queue_depth: 2,
        }
    }
}

/// What happens to a sequence whose pages were reclaimed by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Re-queue with the original arrival order and recompute from scratch,
    /// at most `max_recomputes` times.
    Recompute { max_recomputes: u32 },
    /// Surface the eviction as a failure to the caller.
    Fail,
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Queue depth at which new requests are rejected with backpressure.
    pub max_queue_depth: usize,

    /// Handling of evicted sequences.
    pub eviction_policy: EvictionPolicy,

    /// Capacity of the state-transition event channel.
    pub event_capacity: usize,

    /// Prompts whose KV is kept for prefix reuse (0 disables the cache).
    pub prompt_cache_entries: usize,

    /// Bytes of KV the prompt cache may hold.
    pub prompt_cache_bytes: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 256,
            eviction_policy: EvictionPolicy::Recompute { max_recomputes: 3 },
            event_capacity: 1024,
            prompt_cache_entries: 64,
            prompt_cache_bytes: 64 << 20,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Rewrite budgets and worker counts for a preset.
    pub fn apply_preset(&mut self, preset: Preset) {
        match preset {
            Preset::Latency => {
                self.scheduler.token_budget = 512;
                self.scheduler.memory_budget_pages = 64;
                self.scheduler.max_batch_size = 4;
                self.workers.workers = 2;
                self.admission.max_queue_depth = 64;
            }
            Preset::Throughput => {
                self.scheduler.token_budget = 8192;
                self.scheduler.memory_budget_pages = 1024;
                self.scheduler.max_batch_size = 64;
                self.workers.workers = 8;
                self.admission.max_queue_depth = 1024;
            }
        }
    }

    /// Builder-style variant of [`Config::apply_preset`].
    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.apply_preset(preset);
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("cache.page_tokens", self.cache.page_tokens),
            ("cache.capacity_pages", self.cache.capacity_pages),
            ("model.kv_dim", self.model.kv_dim),
            ("model.context_window", self.model.context_window),
            ("scheduler.token_budget", self.scheduler.token_budget),
            ("scheduler.max_batch_size", self.scheduler.max_batch_size),
            ("scheduler.memory_budget_pages", self.scheduler.memory_budget_pages),
            ("scheduler.decode_chunk", self.scheduler.decode_chunk),
            ("workers.workers", self.workers.workers),
            ("workers.local_queue_depth", self.workers.local_queue_depth),
            ("admission.max_queue_depth", self.admission.max_queue_depth),
            ("admission.event_capacity", self.admission.event_capacity),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.scheduler.starvation_rounds == 0 {
            return Err(ConfigError::Zero {
                field: "scheduler.starvation_rounds",
            });
        }
        if self.scheduler.deferral_boost_after == 0 {
            return Err(ConfigError::Zero {
                field: "scheduler.deferral_boost_after",
            });
        }
        if self.scheduler.memory_budget_pages > self.cache.capacity_pages {
            return Err(ConfigError::Exceeds {
                field: "scheduler.memory_budget_pages",
                value: self.scheduler.memory_budget_pages,
                limit_name: "cache.capacity_pages",
                limit: self.cache.capacity_pages,
            });
        }
        let tuning = &self.scheduler.tuning;
        if tuning.min_token_budget > tuning.max_token_budget {
            return Err(ConfigError::InvertedTuningBounds {
                min: tuning.min_token_budget,
                max: tuning.max_token_budget,
            });
        }
        Ok(())
    }

    /// Bytes of one quantized page (K and V, one byte per element).
    pub fn page_bytes(&self) -> usize {
        self.cache.page_tokens * self.model.kv_dim * 2
    }

    /// Bytes the same page would need at f32 precision.
    pub fn full_precision_page_bytes(&self) -> usize {
        self.page_bytes() * std::mem::size_of::<f32>()
    }

    /// Pages needed by one sequence filling the whole context window.
    pub fn max_sequence_pages(&self) -> usize {
        pages_for_tokens(self.model.context_window, self.cache.page_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.page_tokens, 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_page_bytes() {
        let cfg = Config::default();
        // page_tokens(16) * kv_dim(128) * 2(K+V) * 1 byte
        assert_eq!(cfg.page_bytes(), 16 * 128 * 2);
        assert_eq!(cfg.full_precision_page_bytes(), cfg.page_bytes() * 4);
    }

    #[test]
    fn test_presets_only_touch_budgets() {
        let latency = Config::default().with_preset(Preset::Latency);
        let throughput = Config::default().with_preset(Preset::Throughput);
        assert!(latency.scheduler.token_budget < throughput.scheduler.token_budget);
        assert!(latency.workers.workers < throughput.workers.workers);
        assert_eq!(latency.cache.page_tokens, throughput.cache.page_tokens);
        assert_eq!(latency.model.kv_dim, throughput.model.kv_dim);
    }

    #[test]
    fn test_validate_rejects_zero_page_tokens() {
        let mut cfg = Config::default();
        cfg.cache.page_tokens = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Zero { field: "cache.page_tokens" })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_memory_budget() {
        let mut cfg = Config::default();
        cfg.scheduler.memory_budget_pages = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Zero { field: "scheduler.memory_budget_pages" })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"cache": {"capacity_pages": 100}}"#).unwrap();
        assert_eq!(cfg.cache.capacity_pages, 100);
        assert_eq!(cfg.cache.page_tokens, 16);
        assert_eq!(cfg.scheduler.token_budget, 2048);
    }

    #[test]
    fn test_eviction_policy_json() {
        let cfg: Config = serde_json::from_str(
            r#"{"admission": {"eviction_policy": {"mode": "fail"}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.admission.eviction_policy, EvictionPolicy::Fail);
    }
}
