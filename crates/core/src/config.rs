use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs; every field has a default so partial config files load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Used when neither the step nor the definition carries a retry policy
    #[serde(default)]
    pub default_max_retries: u32,

    #[serde(default)]
    pub default_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Interval between re-checks of executions that are blocked but bounded by a max duration
    #[serde(default = "default_poll_interval_ms")]
    pub approval_poll_interval_ms: u64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 0,
            default_backoff_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            default_step_timeout_secs: default_step_timeout_secs(),
            approval_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.approval_poll_interval_ms.max(1))
    }

    /// Backoff before retry number `retry` (1-based), capped at `max_backoff_ms`
    pub fn backoff_for(&self, base_ms: u64, multiplier: Option<f64>, retry: u32) -> Duration {
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let factor = multiplier.unwrap_or(self.backoff_multiplier).max(1.0);
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = (base_ms as f64) * factor.powi(exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }
}
