//! simulation tools for the DTD radio link

pub mod display;
pub mod scenarios;

use std::path::Path;

use dtd_radio::{ConfigError, FaultConfig, LinkConfig, RetryPolicy, SyntheticConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Reads a JSON link config; missing fields take their defaults. The result
/// is validated before it is returned.
pub fn load_config(path: impl AsRef<Path>) -> Result<LinkConfig, SimError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| SimError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text).map_err(|e| match e {
        SimError::Parse { source, .. } => SimError::Parse {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

pub fn parse_config(text: &str) -> Result<LinkConfig, SimError> {
    let config: LinkConfig = serde_json::from_str(text).map_err(|source| SimError::Parse {
        path: "<inline>".to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> LinkConfig {
        LinkConfig {
            synthetic: SyntheticConfig {
                latency_ms: 80,
                jitter_ms: 20,
                ..Default::default()
            },
            faults: None,
            ..Default::default()
        }
    }

    pub fn average_conditions() -> LinkConfig {
        LinkConfig {
            synthetic: SyntheticConfig {
                latency_ms: 150,
                jitter_ms: 60,
                ..Default::default()
            },
            faults: Some(FaultConfig {
                drop_probability: 0.1,
                corrupt_probability: 0.05,
                seed: None,
            }),
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> LinkConfig {
        LinkConfig {
            synthetic: SyntheticConfig {
                latency_ms: 350,
                jitter_ms: 150,
                ..Default::default()
            },
            faults: Some(FaultConfig {
                drop_probability: 0.3,
                corrupt_probability: 0.1,
                seed: None,
            }),
            ..Default::default()
        }
    }

    /// Replies regularly miss the first timeout; most units need retries.
    pub fn extreme_conditions() -> LinkConfig {
        LinkConfig {
            poll_period_ms: 3000,
            retry: RetryPolicy {
                max_retries: 4,
                ..Default::default()
            },
            synthetic: SyntheticConfig {
                latency_ms: 600,
                jitter_ms: 250,
                state_flip_one_in: 4,
                ..Default::default()
            },
            faults: Some(FaultConfig {
                drop_probability: 0.5,
                corrupt_probability: 0.2,
                seed: None,
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            SimulationPresets::good_conditions(),
            SimulationPresets::average_conditions(),
            SimulationPresets::poor_conditions(),
            SimulationPresets::extreme_conditions(),
        ] {
            assert!(config.validate().is_ok(), "{:?}", config.validate());
        }
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let config = parse_config(r#"{ "allowed_addresses": [2, 4], "retry": { "max_retries": 5 } }"#).unwrap();
        assert_eq!(config.allowed_addresses, vec![2, 4]);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.timeout_base_ms, 500);
        assert_eq!(config.poll_period_ms, 1500);
        assert!(config.simulate);
    }

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = parse_config(r#"{ "allowed_addresses": [0, 3, 3], "queue_capacity": 0 }"#).unwrap_err();
        let SimError::Invalid(ConfigError::Invalid(problems)) = err else {
            panic!("expected validation failure, got {err:?}");
        };
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse_config("{ nope"), Err(SimError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, SimError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
