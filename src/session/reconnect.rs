//! Reconnect backoff for device links

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Delay before the first reconnection attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier (exponential backoff)
    #[serde(alias = "backoff_multiplier")]
    pub multiplier: f64,

    /// Maximum number of consecutive attempts (None = infinite)
    pub max_attempts: Option<u32>,

    /// Jitter factor to spread reconnects of many sessions
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
            jitter_factor: 0.1,
        }
    }
}

/// Backoff state for one session
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectionConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectionConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or None once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt >= max_attempts {
                return None;
            }
        }
        self.attempt += 1;

        let base = self.delay;
        let grown = base.as_secs_f64() * self.config.multiplier.max(1.0);
        self.delay = Duration::from_secs_f64(grown.min(self.config.max_delay.as_secs_f64()));

        let jitter = (base.as_millis() as f64 * self.config.jitter_factor) as u64;
        let random_jitter = if jitter > 0 {
            rand::random::<u64>() % jitter
        } else {
            0
        };
        Some(base + Duration::from_millis(random_jitter))
    }

    /// Forget past failures after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}
