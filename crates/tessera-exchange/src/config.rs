//! Exchange configuration.

use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and retry parameters for the exchange worker.
///
/// A request that gets no reply within `request_timeout_ms` is resent
/// on the same tag, with the timeout multiplied by `backoff_factor`
/// after every resend (capped at `max_backoff_ms`). After `max_retries`
/// resends the request fails with a timeout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// How long the worker waits for traffic before re-checking parked
    /// requests and deadlines, in milliseconds.
    pub poll_interval_ms: u64,
    /// Time allowed for the first reply, in milliseconds.
    pub request_timeout_ms: u64,
    /// Number of resends after the first attempt.
    pub max_retries: u32,
    /// Timeout multiplier applied after each resend.
    pub backoff_factor: f64,
    /// Upper bound on the per-attempt timeout, in milliseconds.
    pub max_backoff_ms: u64,
    /// Capacity of each rank's inbox, in frames.
    pub inbox_capacity: usize,
}

impl ExchangeConfig {
    /// Per-attempt timeout for the first attempt.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Worker poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout for the attempt after one that waited `current`.
    pub fn next_timeout(&self, current: Duration) -> Duration {
        let scaled = current.mul_f64(self.backoff_factor);
        scaled.min(Duration::from_millis(self.max_backoff_ms))
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        let invalid = |reason: String| Err(ExchangeError::InvalidConfig { reason });
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0".into());
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be > 0".into());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid(format!(
                "backoff_factor must be finite and >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if self.max_backoff_ms < self.request_timeout_ms {
            return invalid(format!(
                "max_backoff_ms ({}) must be >= request_timeout_ms ({})",
                self.max_backoff_ms, self.request_timeout_ms
            ));
        }
        if self.inbox_capacity == 0 {
            return invalid("inbox_capacity must be > 0".into());
        }
        Ok(())
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            request_timeout_ms: 500,
            max_retries: 6,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
            inbox_capacity: 1_024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(ExchangeConfig::default().validate().is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = ExchangeConfig {
            request_timeout_ms: 100,
            backoff_factor: 3.0,
            max_backoff_ms: 500,
            ..ExchangeConfig::default()
        };
        let t1 = cfg.next_timeout(cfg.request_timeout());
        assert_eq!(t1, Duration::from_millis(300));
        assert_eq!(cfg.next_timeout(t1), Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_backoff_factor() {
        for factor in [0.5, f64::NAN, f64::INFINITY] {
            let cfg = ExchangeConfig {
                backoff_factor: factor,
                ..ExchangeConfig::default()
            };
            assert!(matches!(
                cfg.validate(),
                Err(ExchangeError::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn rejects_max_backoff_below_timeout() {
        let cfg = ExchangeConfig {
            request_timeout_ms: 100,
            max_backoff_ms: 50,
            ..ExchangeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_partial_json() {
        let cfg: ExchangeConfig =
            serde_json::from_str(r#"{"request_timeout_ms": 20, "max_retries": 2}"#).unwrap();
        assert_eq!(cfg.request_timeout_ms, 20);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.poll_interval_ms, 1);
    }
}
