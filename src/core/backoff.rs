//! Retry delays for live shape fetches.

use std::time::Duration;

use rand::Rng;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base_ms = (base.as_millis() as u64).max(1);
        Self {
            base_ms,
            max_ms: (max.as_millis() as u64).max(base_ms),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_max_ms),
        )
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_ms.saturating_mul(1_u64 << exp).min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// `base_delay` plus up to 20% random jitter, never above the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=(base / 5).max(1));
        Duration::from_millis(base.saturating_add(jitter).min(self.max_ms))
    }
}
