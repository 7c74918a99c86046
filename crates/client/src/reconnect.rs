//! Reconnection backoff policy.

#![allow(missing_docs)]

use std::time::Duration;

use chatwire_common::config::SyncConfig;
use rand::Rng;

/// Backoff policy applied between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for ReconnectPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            initial_delay: Duration::from_millis(config.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            multiplier: config.reconnect_multiplier,
            jitter: config.reconnect_jitter.clamp(0.0, 1.0),
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for the given attempt number (0-indexed).
    ///
    /// Jitter spreads simultaneous reconnects from many clients so they do
    /// not hit the server in lockstep.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return self.max_delay;
        }

        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(self.spread(capped))
    }

    /// Check if another attempt should be scheduled after the given number
    /// of attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn spread(&self, delay_secs: f64) -> f64 {
        if self.jitter <= 0.0 {
            return delay_secs;
        }

        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        (delay_secs * (1.0 + factor)).max(0.0)
    }
}
