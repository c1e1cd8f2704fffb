//! Bounded exponential backoff for blocking sends.
//!
//! A full OS send buffer is a transient condition, not an error: the
//! writer thread sleeps and retries, doubling the delay up to a ceiling,
//! and resets to the floor as soon as bytes move again.

use std::time::Duration;

/// Backoff bounds.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First retry delay.
    pub floor: Duration,
    /// Delays never exceed this.
    pub ceiling: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(1),
            ceiling: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
        }
    }
}

/// Doubling retry-delay sequence, capped at the configured ceiling.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.floor,
        }
    }

    /// Returns the next delay to sleep and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.config.ceiling);
        delay
    }

    /// Resets to the floor; call after any successful write.
    pub fn reset(&mut self) {
        self.current = self.config.floor;
    }
}
