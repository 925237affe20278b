//! Node configuration.
//!
//! All timing knobs are durations; on disk (JSON) they are written as
//! integer milliseconds, e.g. `{"rpc_timeout": 1000, "retry_base": 50}`.
//! Missing keys take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::types::NodeId;

/// Default RPC timeout for delivery attempts, pulls and topology pushes.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(1000);
/// First retry delay; doubles per attempt.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(50);
/// Ceiling for the retry delay.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_millis(2000);
/// Lower bound of the anti-entropy poll interval.
pub const DEFAULT_POLL_MIN: Duration = Duration::from_millis(100);
/// Upper bound (exclusive) of the anti-entropy poll interval.
pub const DEFAULT_POLL_MAX: Duration = Duration::from_millis(200);

/// Tunables for one broadcast node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long to wait for any reply
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Delay before the first retry of a failed delivery
    #[serde(with = "duration_ms")]
    pub retry_base: Duration,
    /// Largest delay between two delivery attempts
    #[serde(with = "duration_ms")]
    pub retry_max: Duration,
    /// Give up on a job after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Shortest pause between two anti-entropy rounds
    #[serde(with = "duration_ms")]
    pub poll_min: Duration,
    /// Longest pause between two anti-entropy rounds (exclusive)
    #[serde(with = "duration_ms")]
    pub poll_max: Duration,
    /// Node that builds and distributes the tree; defaults to the first id from `init`
    pub coordinator: Option<NodeId>,
    /// Seed for the synthetic edge weights; random when unset
    pub topology_seed: Option<u64>,
    /// Seed for the poll jitter; derived from node id and start time when unset
    pub jitter_seed: Option<u64>,
    /// Install topologies sent by clients instead of acknowledging and ignoring them
    pub accept_client_topology: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            max_attempts: None,
            poll_min: DEFAULT_POLL_MIN,
            poll_max: DEFAULT_POLL_MAX,
            coordinator: None,
            topology_seed: None,
            jitter_seed: None,
            accept_client_topology: false,
        }
    }
}

impl NodeConfig {
    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> NodeResult<()> {
        if self.rpc_timeout.is_zero() {
            return Err(NodeError::Config("rpc_timeout must be positive".into()));
        }
        if self.retry_base.is_zero() {
            return Err(NodeError::Config("retry_base must be positive".into()));
        }
        if self.retry_max < self.retry_base {
            return Err(NodeError::Config(format!(
                "retry_max ({:?}) is below retry_base ({:?})",
                self.retry_max, self.retry_base
            )));
        }
        if self.poll_max <= self.poll_min {
            return Err(NodeError::Config(format!(
                "poll interval [{:?}, {:?}) is empty",
                self.poll_min, self.poll_max
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(NodeError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Delay after the given failed attempt (1-based).
    ///
    /// Exponential from `retry_base`, capped at `retry_max`:
    /// 50ms, 100ms, 200ms, ... 2s, 2s, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.retry_base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = NodeConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(2), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
        assert_eq!(config.backoff(6), Duration::from_millis(1600));
        assert_eq!(config.backoff(7), Duration::from_millis(2000));
        assert_eq!(config.backoff(500), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"rpc_timeout": 250, "coordinator": "n3"}"#).unwrap();
        assert_eq!(config.rpc_timeout, Duration::from_millis(250));
        assert_eq!(config.coordinator, Some(NodeId::from("n3")));
        assert_eq!(config.retry_base, DEFAULT_RETRY_BASE);
        assert!(!config.accept_client_topology);
    }

    #[test]
    fn test_empty_poll_window_is_rejected() {
        let config = NodeConfig {
            poll_min: Duration::from_millis(200),
            poll_max: Duration::from_millis(200),
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"max_attempts": 5, "topology_seed": 7}"#).unwrap();

        let config = NodeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.topology_seed, Some(7));
    }
}
