//! Backoff configuration and delay calculation.
//!
//! Provides the portable, sync-only building blocks. The async retry loops
//! live next to the code that retries (job submission and resubscription in
//! `proplens-jobs`).
//!
//! Formula: `delay(n) = min(base_delay · multiplier^(n-1), max_delay)` with
//! `n` the 1-based attempt number.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum retries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
/// Default growth factor between attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Default delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in ms.
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay, in ms.
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RETRY_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl BackoffPolicy {
    /// Build a policy from explicit values.
    pub fn new(base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            multiplier,
            max_delay_ms,
        }
    }

    /// Delay in milliseconds before attempt `attempt` (1-based).
    ///
    /// Attempt `0` is treated as `1`. Never exceeds `max_delay_ms`, and never
    /// overflows for large attempt numbers.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(1024) as i32;
        let raw = (self.base_delay_ms as f64) * self.multiplier.max(0.0).powi(exponent);
        let cap = self.max_delay_ms as f64;
        if !raw.is_finite() || raw >= cap {
            return self.max_delay_ms;
        }
        raw.round().max(0.0) as u64
    }

    /// Same as [`delay_ms`](Self::delay_ms) as a [`Duration`].
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
