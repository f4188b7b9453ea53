//! Exponential backoff for outbound connects.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Retry behaviour of the connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts after the first (default: 5).
    pub max_retries: u32,
    /// First delay in milliseconds (default: 100).
    pub initial_backoff_ms: u64,
    /// Delay cap in milliseconds (default: 5000).
    pub max_backoff_ms: u64,
    /// Growth factor per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff_ms == 0 {
            return Err(TransportError::invalid_config("connect_retry.initial_backoff_ms", "must be non-zero"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(TransportError::invalid_config(
                "connect_retry.max_backoff_ms",
                "must be at least initial_backoff_ms",
            ));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(TransportError::invalid_config("connect_retry.backoff_multiplier", "must be >= 1.0"));
        }
        Ok(())
    }
}

/// Delay before retry number `attempt` (0-based).
///
/// `initial * multiplier^attempt`, capped at `max_backoff`. Jitter adds up to
/// half of that delay and never pushes it past the cap.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff_ms as f64;
    let computed = base * config.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let capped = computed.min(config.max_backoff_ms as f64) as u64;

    if config.jitter && capped > 1 {
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped.saturating_add(jitter).min(config.max_backoff_ms))
    } else {
        Duration::from_millis(capped)
    }
}

/// Stateful iterator over retry delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    retries: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The next delay, or `None` once `max_retries` delays were handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        let delay = compute_backoff(&self.config, self.retries);
        self.retries += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = no_jitter();
        assert_eq!(compute_backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_backoff(&config, 3), Duration::from_millis(800));
        assert_eq!(compute_backoff(&config, 10), Duration::from_millis(5_000));
        assert_eq!(compute_backoff(&config, 200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_bounded() {
        let config = RetryConfig::default();
        for attempt in 0..8 {
            let plain = compute_backoff(&no_jitter(), attempt);
            let jittered = compute_backoff(&config, attempt);
            assert!(jittered >= plain);
            assert!(jittered <= plain + plain / 2);
        }
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_never_exceeds_cap(
            initial in 1u64..2_000,
            extra in 0u64..10_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let config = RetryConfig {
                initial_backoff_ms: initial,
                max_backoff_ms: initial + extra,
                backoff_multiplier: multiplier,
                ..RetryConfig::default()
            };
            let delay = compute_backoff(&config, attempt);
            prop_assert!(delay <= Duration::from_millis(config.max_backoff_ms));
            prop_assert!(delay >= Duration::from_millis(initial));
        }
    }

    #[test]
    fn test_backoff_exhausts() {
        let mut backoff = Backoff::new(RetryConfig {
            max_retries: 2,
            ..no_jitter()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.retries(), 2);
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        let bad = RetryConfig {
            max_backoff_ms: 10,
            ..RetryConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
