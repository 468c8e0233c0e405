//! Engine configuration: the knobs a caller may set before a run.
//!
//! Loaded from TOML (durations as integer milliseconds) or built in code,
//! and always validated before any dispatch begins.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    confirm::{TrackerConfig, DEFAULT_CONFIRMATION_TIMEOUT, DEFAULT_POLL_INTERVAL},
    dispatch::{NodeAssignment, DEFAULT_SUBMIT_TIMEOUT},
    error::ConfigError,
    limiter::DEFAULT_BURST_WINDOW,
    pool::MAX_POOL_SIZE,
};

pub const DEFAULT_WRITE_RATE: u32 = 100;
pub const DEFAULT_READ_RATE: u32 = 200;
pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_PER_NODE_CAP: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub node_urls: Vec<String>,
    /// Aggregate submissions per second across all nodes.
    pub write_rate: u32,
    /// Aggregate receipt/nonce lookups per second across all nodes.
    pub read_rate: u32,
    pub workers: usize,
    /// Upper bound on workers per node; requests above `nodes * cap` are clamped.
    pub per_node_cap: usize,
    pub assignment: NodeAssignment,
    /// Track confirmation of independent jobs. Account lanes always confirm.
    pub confirm_jobs: bool,
    #[serde(rename = "confirmation_timeout_ms", with = "millis")]
    pub confirmation_timeout: Duration,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    #[serde(rename = "burst_window_ms", with = "millis")]
    pub burst_window: Duration,
    #[serde(rename = "submit_timeout_ms", with = "millis")]
    pub submit_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_urls: vec![],
            write_rate: DEFAULT_WRITE_RATE,
            read_rate: DEFAULT_READ_RATE,
            workers: DEFAULT_WORKERS,
            per_node_cap: DEFAULT_PER_NODE_CAP,
            assignment: NodeAssignment::default(),
            confirm_jobs: true,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            burst_window: DEFAULT_BURST_WINDOW,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            timeout: self.confirmation_timeout,
            poll_interval: self.poll_interval,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_urls.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if self.node_urls.len() > MAX_POOL_SIZE {
            return Err(ConfigError::TooManyNodes(self.node_urls.len()));
        }
        for (name, rate) in [("write rate", self.write_rate), ("read rate", self.read_rate)] {
            if rate == 0 {
                return Err(ConfigError::NonPositiveRate {
                    name,
                    value: rate.into(),
                });
            }
            if (rate as usize) < self.node_urls.len() {
                return Err(ConfigError::RateBelowNodeCount {
                    name,
                    rate,
                    nodes: self.node_urls.len(),
                });
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.per_node_cap == 0 {
            return Err(ConfigError::NoPerNodeCap);
        }
        for (name, value) in [
            ("confirmation timeout", self.confirmation_timeout),
            ("poll interval", self.poll_interval),
            ("burst window", self.burst_window),
            ("submit timeout", self.submit_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name, value });
            }
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(nodes: usize) -> EngineConfig {
        EngineConfig {
            node_urls: (0..nodes).map(|i| format!("http://node-{i}:8545")).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            node_urls = ["http://a:8545", "http://b:8545"]
            write_rate = 500
            poll_interval_ms = 250
            assignment = "global-least-loaded"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_urls.len(), 2);
        assert_eq!(config.write_rate, 500);
        assert_eq!(config.read_rate, DEFAULT_READ_RATE);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.burst_window, Duration::from_millis(100));
        assert_eq!(config.assignment, NodeAssignment::GlobalLeastLoaded);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_round_trip_keeps_millis() {
        let mut original = config(3);
        original.confirmation_timeout = Duration::from_millis(12_345);
        let text = original.to_toml_string().unwrap();
        assert!(text.contains("confirmation_timeout_ms = 12345"));
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), original);
    }

    #[test]
    fn rejects_unknown_and_malformed_fields() {
        assert!(matches!(
            EngineConfig::from_toml_str("write_rte = 5"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("write_rate = -5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation_catches_bad_runs_before_dispatch() {
        assert_eq!(config(0).validate(), Err(ConfigError::NoNodes));
        assert_eq!(config(14).validate(), Err(ConfigError::TooManyNodes(14)));

        let mut c = config(2);
        c.write_rate = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NonPositiveRate { name: "write rate", .. })
        ));

        let mut c = config(4);
        c.read_rate = 3;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::RateBelowNodeCount { rate: 3, nodes: 4, .. })
        ));

        let mut c = config(2);
        c.workers = 0;
        assert_eq!(c.validate(), Err(ConfigError::NoWorkers));

        let mut c = config(2);
        c.poll_interval = Duration::ZERO;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::ZeroDuration { name: "poll interval", .. })
        ));

        let mut c = config(2);
        c.burst_window = Duration::ZERO;
        assert!(c.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            EngineConfig::from_file("/definitely/not/here.toml"),
            Err(ConfigError::Read(_))
        ));
    }
}
