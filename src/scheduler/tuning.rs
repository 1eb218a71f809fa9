//! Adaptive token-budget tuning.
//!
//! Plain state plus a pure update function: the dispatcher feeds one
//! [`TuningSample`] per completed batch into [`step`] and uses the returned
//! state's budget for the next round.

use serde::Serialize;

use crate::config::TuningConfig;

/// Tuner state carried between rounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TuningState {
    /// Token budget for the next round.
    pub token_budget: usize,
    /// Smoothed batch latency, `None` until the first sample.
    pub ewma_latency_ms: Option<f64>,
    /// Number of budget changes made so far.
    pub adjustments: u64,
}

impl TuningState {
    pub fn new(token_budget: usize) -> Self {
        Self {
            token_budget,
            ewma_latency_ms: None,
            adjustments: 0,
        }
    }
}

/// One observed batch.
#[derive(Debug, Clone, Copy)]
pub struct TuningSample {
    pub latency_ms: f64,
    /// Tokens the batch actually used.
    pub tokens: usize,
}

/// Next tuner state.
///
/// Shrinks the budget when smoothed latency is more than 10% above target,
/// grows it when latency is more than 10% below target and the last batch
/// used at least half the budget. The budget stays within the configured
/// bounds.
pub fn step(state: TuningState, sample: TuningSample, config: &TuningConfig) -> TuningState {
    if !config.enabled {
        return state;
    }
    let alpha = config.ewma_alpha.clamp(0.0, 1.0);
    let ewma = match state.ewma_latency_ms {
        Some(prev) => alpha * sample.latency_ms + (1.0 - alpha) * prev,
        None => sample.latency_ms,
    };

    let target = config.target_latency_ms as f64;
    let current = state.token_budget as f64;
    let delta = (current * config.step_fraction).max(1.0);
    let proposed = if ewma > target * 1.1 {
        current - delta
    } else if ewma < target * 0.9 && sample.tokens * 2 >= state.token_budget {
        current + delta
    } else {
        current
    };
    let budget = (proposed.round() as usize).clamp(config.min_token_budget, config.max_token_budget);

    TuningState {
        token_budget: budget,
        ewma_latency_ms: Some(ewma),
        adjustments: state.adjustments + u64::from(budget != state.token_budget),
    }
}
