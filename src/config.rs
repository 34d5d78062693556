//! Configuration types.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! overrides.

use {
    crate::{RingError, RingResult, timestamp::ConflictPolicy},
    serde::{Deserialize, Serialize},
    std::{path::Path, time::Duration},
};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub replicator: ReplicatorConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> RingResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> RingResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Ring builder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// The ring has `2^part_power` partitions.
    #[serde(default = "default_part_power")]
    pub part_power: u8,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Move at most one replica of a partition per rebalance for balance
    /// reasons.
    #[serde(default = "default_true")]
    pub one_replica_move_per_rebalance: bool,
    #[serde(default)]
    pub hash_prefix: String,
    #[serde(default)]
    pub hash_suffix: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            part_power: default_part_power(),
            replicas: default_replicas(),
            one_replica_move_per_rebalance: true,
            hash_prefix: String::new(),
            hash_suffix: String::new(),
        }
    }
}

/// Number of acknowledgements an operation needs out of `n` replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// `floor(n / 2) + 1`.
    #[default]
    Majority,
    All,
    One,
    /// A fixed count, clamped to `1..=n`.
    Fixed(usize),
}

impl QuorumPolicy {
    pub fn size(&self, replicas: usize) -> usize {
        match self {
            Self::Majority => replicas / 2 + 1,
            Self::All => replicas,
            Self::One => 1,
            Self::Fixed(n) => (*n).clamp(1, replicas.max(1)),
        }
    }
}

/// Request coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub write_quorum: QuorumPolicy,
    #[serde(default)]
    pub read_quorum: QuorumPolicy,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Per replica call timeout.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// How long to keep waiting for stragglers once quorum is reached.
    #[serde(default = "default_post_quorum_timeout_ms")]
    pub post_quorum_timeout_ms: u64,
    /// Number of primaries a read is sent to; all of them when unset.
    #[serde(default)]
    pub read_fanout: Option<usize>,
    /// Handoff devices tried per request; the replica count when unset.
    #[serde(default)]
    pub max_handoffs_per_request: Option<usize>,
    #[serde(default = "default_error_suppression_limit")]
    pub error_suppression_limit: u32,
    #[serde(default = "default_error_suppression_interval_secs")]
    pub error_suppression_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            write_quorum: QuorumPolicy::Majority,
            read_quorum: QuorumPolicy::Majority,
            conflict_policy: ConflictPolicy::default(),
            node_timeout_ms: default_node_timeout_ms(),
            post_quorum_timeout_ms: default_post_quorum_timeout_ms(),
            read_fanout: None,
            max_handoffs_per_request: None,
            error_suppression_limit: default_error_suppression_limit(),
            error_suppression_interval_secs: default_error_suppression_interval_secs(),
        }
    }
}

impl CoordinatorConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn post_quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.post_quorum_timeout_ms)
    }

    pub fn error_suppression_interval(&self) -> Duration {
        Duration::from_secs(self.error_suppression_interval_secs)
    }
}

/// Partition replicator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Pause between scan cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Partitions replicated at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Bulk transfers in flight at once.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Tombstones older than this are purged.
    #[serde(default = "default_reclaim_age_secs")]
    pub reclaim_age_secs: u64,
    #[serde(default = "default_max_backoff_cycles")]
    pub max_backoff_cycles: u64,
    /// Consecutive failures after which a peer is reported unhealthy.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,
    #[serde(default = "default_fingerprint_buckets")]
    pub fingerprint_buckets: u16,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrency: default_concurrency(),
            max_connections: default_max_connections(),
            node_timeout_ms: default_node_timeout_ms(),
            reclaim_age_secs: default_reclaim_age_secs(),
            max_backoff_cycles: default_max_backoff_cycles(),
            alert_threshold: default_alert_threshold(),
            fingerprint_buckets: default_fingerprint_buckets(),
        }
    }
}

impl ReplicatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn reclaim_age(&self) -> Duration {
        Duration::from_secs(self.reclaim_age_secs)
    }

    pub(crate) fn validate(&self) -> RingResult<()> {
        if self.concurrency == 0 || self.max_connections == 0 {
            return Err(RingError::Config(
                "replicator concurrency and max_connections must be positive".to_string(),
            ));
        }
        if self.fingerprint_buckets == 0 {
            return Err(RingError::Config("fingerprint_buckets must be positive".to_string()));
        }
        Ok(())
    }
}

fn default_part_power() -> u8 {
    10
}

fn default_replicas() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_node_timeout_ms() -> u64 {
    10_000
}

fn default_post_quorum_timeout_ms() -> u64 {
    500
}

fn default_error_suppression_limit() -> u32 {
    10
}

fn default_error_suppression_interval_secs() -> u64 {
    60
}

fn default_interval_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_max_connections() -> usize {
    2
}

fn default_reclaim_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_backoff_cycles() -> u64 {
    16
}

fn default_alert_threshold() -> u32 {
    5
}

fn default_fingerprint_buckets() -> u16 {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.replicator.reclaim_age(), Duration::from_secs(604_800));
        assert_eq!(config.coordinator.post_quorum_timeout(), Duration::from_millis(500));

        let config = Config::from_toml_str(
            r#"
            [builder]
            part_power = 16
            hash_suffix = "changeme"

            [coordinator]
            write_quorum = "all"
            read_quorum = { fixed = 2 }
            conflict_policy = "timestamp_then_tombstone"

            [replicator]
            concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.builder.part_power, 16);
        assert_eq!(config.builder.replicas, 3);
        assert_eq!(config.builder.hash_suffix, "changeme");
        assert_eq!(config.coordinator.write_quorum, QuorumPolicy::All);
        assert_eq!(config.coordinator.read_quorum, QuorumPolicy::Fixed(2));
        assert_eq!(
            config.coordinator.conflict_policy,
            ConflictPolicy::TimestampThenTombstone
        );
        assert_eq!(config.replicator.concurrency, 8);
        assert_eq!(config.replicator.max_connections, 2);

        assert!(Config::from_toml_str("[builder]\npart_power = \"x\"").is_err());
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(QuorumPolicy::Majority.size(3), 2);
        assert_eq!(QuorumPolicy::Majority.size(4), 3);
        assert_eq!(QuorumPolicy::Majority.size(5), 3);
        assert_eq!(QuorumPolicy::All.size(3), 3);
        assert_eq!(QuorumPolicy::One.size(3), 1);
        assert_eq!(QuorumPolicy::Fixed(7).size(3), 3);
        assert_eq!(QuorumPolicy::Fixed(0).size(3), 1);
    }
}
