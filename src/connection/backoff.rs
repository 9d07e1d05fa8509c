//! Reconnect backoff policy.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential backoff with a ceiling.
///
/// Attempt `n` (1-based) waits `initial * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
}

impl Backoff {
    /// Build a policy from configuration.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_ms: config.initial_delay_ms,
            max_ms: config.max_delay_ms.max(config.initial_delay_ms),
            multiplier: if config.multiplier.is_finite() {
                config.multiplier.max(1.0)
            } else {
                1.0
            },
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay_ms = self.initial_ms;
        for _ in 1..attempt.max(1) {
            if delay_ms >= self.max_ms {
                break;
            }
            delay_ms = scale(delay_ms, self.multiplier).min(self.max_ms);
        }
        Duration::from_millis(delay_ms.min(self.max_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Multiply `value` by `factor`, saturating at `u64::MAX`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn scale(value: u64, factor: f64) -> u64 {
    let scaled = (value as f64) * factor;
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}
