use chrono::Duration;
use taskq_core::config::{SchedulerConfig, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_CAP_SECS};

/// Exponential retry delay: `min(cap, base * 2^(attempts - 1))`.
///
/// `attempts <= 1` (including negative input) yields `min(cap, base)`.
/// Saturates instead of overflowing for very large attempt counts.
pub fn backoff_seconds(attempts: i64, base: u64, cap: u64) -> u64 {
    let exponent = attempts.max(1) - 1;
    let factor = u32::try_from(exponent)
        .ok()
        .and_then(|e| 2u64.checked_pow(e))
        .unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Backoff parameters carried by the components that schedule retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl Backoff {
    pub fn new(base_secs: u64, cap_secs: u64) -> Self {
        Self {
            base_secs,
            cap_secs,
        }
    }

    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self::new(cfg.backoff_base_secs, cfg.backoff_cap_secs)
    }

    pub fn delay_secs(&self, attempts: i64) -> u64 {
        backoff_seconds(attempts, self.base_secs, self.cap_secs)
    }

    pub fn delay(&self, attempts: i64) -> Duration {
        // chrono durations top out at i64::MAX milliseconds.
        let secs = self.delay_secs(attempts).min((i64::MAX / 1_000) as u64);
        Duration::seconds(secs as i64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_CAP_SECS)
    }
}
