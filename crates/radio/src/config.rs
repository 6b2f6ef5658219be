//! Link configuration, built once and validated before the engine starts

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Poll periods below this are clamped up.
pub const MIN_POLL_PERIOD_MS: u64 = 150;

/// Poll periods above this are clamped down and rejected by validation.
pub const MAX_POLL_PERIOD_MS: u64 = 3_600_000;

/// Upper bound on units polled by one link.
pub const MAX_TARGETS: usize = 10;

/// Ceiling for any single reply timeout, however far it has grown.
pub const MAX_REPLY_TIMEOUT_MS: u64 = 60_000;

/// Ceiling for any single backoff delay.
pub const MAX_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout_base_ms: u64,
    pub timeout_multiplier: f64,
    pub backoff_enabled: bool,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_base_ms: 500,
            timeout_multiplier: 1.5,
            backoff_enabled: true,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Reply timeout for zero-based `attempt`: `base * multiplier^attempt`,
    /// capped at [`MAX_REPLY_TIMEOUT_MS`].
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ms = self.timeout_base_ms as f64 * self.timeout_multiplier.powi(exponent);
        let ms = if ms.is_nan() {
            MAX_REPLY_TIMEOUT_MS
        } else {
            (ms.round() as u64).min(MAX_REPLY_TIMEOUT_MS)
        };
        Duration::from_millis(ms)
    }

    /// Delay inserted after a failed zero-based `attempt`, capped at
    /// [`MAX_BACKOFF_MS`].
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        self.backoff_enabled.then(|| {
            let ms = self.backoff_ms.saturating_mul(u64::from(attempt).saturating_add(1));
            Duration::from_millis(ms.min(MAX_BACKOFF_MS))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 9600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Mean reply latency.
    pub latency_ms: u64,
    /// Standard deviation of the reply latency.
    pub jitter_ms: u64,
    pub seed: Option<u64>,
    /// A simulated unit flips PRESENT/ABSENT once in this many status requests.
    pub state_flip_one_in: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            latency_ms: 100,
            jitter_ms: 30,
            seed: None,
            state_flip_one_in: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub drop_probability: f64,
    pub corrupt_probability: f64,
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            drop_probability: 0.1,
            corrupt_probability: 0.05,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Units to poll, in poll order. Also the exchange allow-list.
    pub allowed_addresses: Vec<u8>,
    pub poll_period_ms: u64,
    pub retry: RetryPolicy,
    pub simulate: bool,
    /// Refuse to fall back to the synthetic link when the radio is missing.
    pub hardware_required: bool,
    pub queue_capacity: usize,
    pub serial: Option<SerialConfig>,
    pub synthetic: SyntheticConfig,
    pub faults: Option<FaultConfig>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            allowed_addresses: vec![1, 2, 3, 4, 5],
            poll_period_ms: 1500,
            retry: RetryPolicy::default(),
            simulate: true,
            hardware_required: false,
            queue_capacity: 10,
            serial: None,
            synthetic: SyntheticConfig::default(),
            faults: None,
        }
    }
}

impl LinkConfig {
    pub fn allow_list(&self) -> BTreeSet<u8> {
        self.allowed_addresses.iter().copied().collect()
    }

    /// Configured period, clamped to `MIN_POLL_PERIOD_MS..=MAX_POLL_PERIOD_MS`.
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.clamp(MIN_POLL_PERIOD_MS, MAX_POLL_PERIOD_MS))
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.allowed_addresses.is_empty() {
            problems.push("allowed_addresses is empty".to_string());
        }
        if self.allowed_addresses.len() > MAX_TARGETS {
            problems.push(format!(
                "too many addresses ({}, max {})",
                self.allowed_addresses.len(),
                MAX_TARGETS
            ));
        }
        if self.allowed_addresses.contains(&0) {
            problems.push("address 0 is reserved for the radio module".to_string());
        }
        if self.allow_list().len() != self.allowed_addresses.len() {
            problems.push("allowed_addresses contains duplicates".to_string());
        }

        let retry = &self.retry;
        if retry.max_retries < 1 {
            problems.push("retry.max_retries must be >= 1".to_string());
        }
        if retry.timeout_base_ms < 100 {
            problems.push(format!(
                "retry.timeout_base_ms too short ({} < 100)",
                retry.timeout_base_ms
            ));
        }
        if retry.timeout_base_ms > MAX_REPLY_TIMEOUT_MS {
            problems.push(format!(
                "retry.timeout_base_ms too long ({} > {})",
                retry.timeout_base_ms, MAX_REPLY_TIMEOUT_MS
            ));
        }
        if retry.backoff_ms > MAX_BACKOFF_MS {
            problems.push(format!(
                "retry.backoff_ms too long ({} > {})",
                retry.backoff_ms, MAX_BACKOFF_MS
            ));
        }
        if self.poll_period_ms > MAX_POLL_PERIOD_MS {
            problems.push(format!(
                "poll_period_ms too long ({} > {})",
                self.poll_period_ms, MAX_POLL_PERIOD_MS
            ));
        }
        if !(retry.timeout_multiplier >= 1.0) {
            problems.push(format!(
                "retry.timeout_multiplier must be >= 1.0 (got {})",
                retry.timeout_multiplier
            ));
        }
        if retry.timeout_base_ms >= self.poll_period_ms {
            problems.push(format!(
                "reply timeout ({} ms) >= poll period ({} ms)",
                retry.timeout_base_ms, self.poll_period_ms
            ));
        }

        if self.queue_capacity == 0 {
            problems.push("queue_capacity must be > 0".to_string());
        }

        if let Some(faults) = &self.faults {
            for (name, p) in [
                ("faults.drop_probability", faults.drop_probability),
                ("faults.corrupt_probability", faults.corrupt_probability),
            ] {
                if !(0.0..=1.0).contains(&p) {
                    problems.push(format!("{} outside [0, 1] ({})", name, p));
                }
            }
        }

        if self.hardware_required {
            if self.simulate {
                problems.push("hardware_required conflicts with simulate".to_string());
            }
            if self.serial.is_none() {
                problems.push("hardware_required but no serial port configured".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(LinkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_timeout_growth() {
        let policy = RetryPolicy::default();
        let timeouts: Vec<_> = (0..3).map(|i| policy.timeout_for(i).as_millis()).collect();
        assert_eq!(timeouts, vec![500, 750, 1125]);
    }

    #[test]
    fn test_backoff_is_linear_and_optional() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.backoff_for(2), Some(Duration::from_millis(300)));

        policy.backoff_enabled = false;
        assert_eq!(policy.backoff_for(0), None);
    }

    #[test]
    fn test_oversized_durations_are_rejected_and_capped() {
        let config: LinkConfig = serde_json::from_str(
            r#"{ "poll_period_ms": 18446744073709551615,
                 "retry": { "backoff_ms": 18446744073709551615,
                            "timeout_base_ms": 18446744073709551000 } }"#,
        )
        .unwrap();

        let ConfigError::Invalid(problems) = config.validate().unwrap_err();
        assert_eq!(problems.len(), 3, "{:?}", problems);

        // still safe to use if validation is skipped
        let retry = &config.retry;
        assert_eq!(retry.backoff_for(1), Some(Duration::from_millis(MAX_BACKOFF_MS)));
        assert_eq!(retry.backoff_for(u32::MAX), Some(Duration::from_millis(MAX_BACKOFF_MS)));
        assert_eq!(retry.timeout_for(0), Duration::from_millis(MAX_REPLY_TIMEOUT_MS));
        assert_eq!(config.poll_period(), Duration::from_millis(MAX_POLL_PERIOD_MS));

        let runaway = RetryPolicy {
            timeout_multiplier: f64::INFINITY,
            ..Default::default()
        };
        assert_eq!(runaway.timeout_for(40), Duration::from_millis(MAX_REPLY_TIMEOUT_MS));
    }

    #[test]
    fn test_poll_period_floor() {
        let config = LinkConfig {
            poll_period_ms: 20,
            ..Default::default()
        };
        assert_eq!(config.poll_period(), Duration::from_millis(MIN_POLL_PERIOD_MS));
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let config = LinkConfig {
            allowed_addresses: vec![0, 3, 3],
            retry: RetryPolicy {
                max_retries: 0,
                timeout_base_ms: 50,
                ..Default::default()
            },
            queue_capacity: 0,
            ..Default::default()
        };

        let ConfigError::Invalid(problems) = config.validate().unwrap_err();
        assert_eq!(problems.len(), 5, "{:?}", problems);
    }

    #[test]
    fn test_hardware_required_needs_serial() {
        let config = LinkConfig {
            simulate: false,
            hardware_required: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LinkConfig {
            serial: Some(SerialConfig::new("/dev/ttyUSB0")),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{ "allowed_addresses": [7, 9], "retry": { "max_retries": 5 } }"#)
                .unwrap();
        assert_eq!(config.allowed_addresses, vec![7, 9]);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.timeout_base_ms, 500);
        assert_eq!(config.poll_period_ms, 1500);
    }
}
