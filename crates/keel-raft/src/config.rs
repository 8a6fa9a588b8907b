//! Server and consensus configuration.
//!
//! `ServerConfig` is the bootstrap surface loaded from YAML (or environment
//! variables); `RaftConfig` carries the runtime tuning knobs. Size values
//! accept byte suffixes (`16M`, `1G`); durations accept human notation
//! (`150ms`, `2s`).

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::NodeId;

/// Consensus tuning parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Interval between leader replication rounds (also the heartbeat).
    /// Must be shorter than the minimum election timeout.
    #[serde(deserialize_with = "de_duration")]
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    #[serde(deserialize_with = "de_duration")]
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    #[serde(deserialize_with = "de_duration")]
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendRequest.
    pub max_entries_per_append: usize,

    /// Chunk size used when streaming snapshots to a lagging server.
    #[serde(deserialize_with = "de_size")]
    pub snapshot_chunk_size: u64,

    /// How long a forwarded query or command may wait on the remote server.
    #[serde(deserialize_with = "de_duration")]
    pub forward_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_entries_per_append: 1000,
            snapshot_chunk_size: 1024 * 1024,
            forward_timeout: Duration::from_millis(5000),
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::InvalidField(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::InvalidField(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::InvalidField(
                "max_entries_per_append must be > 0".to_string(),
            ));
        }
        if self.snapshot_chunk_size == 0 {
            return Err(ConfigError::InvalidField(
                "snapshot_chunk_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// A randomized election timeout in `[min, max]`. Each server rolls its
    /// own to avoid split votes.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

/// Top-level server configuration.
///
/// Example YAML:
/// ```yaml
/// node_id: "n1"
/// data_dir: "/var/lib/keel"
/// cluster:
///   name: "keel"
///   members:
///     - { id: "n1", address: "10.0.1.10:7401" }
///     - { id: "n2", address: "10.0.1.11:7401" }
/// management_group:
///   group_type: "raft"
///   partitions: 1
///   segment_size: "16M"
/// partition_groups:
///   data:
///     group_type: "raft"
///     partitions: 7
/// profiles: ["consensus"]
/// raft:
///   heartbeat_interval: "150ms"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unique node identifier; must appear in `cluster.members`.
    pub node_id: String,

    /// Root directory for log, snapshot and metadata storage.
    pub data_dir: PathBuf,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub management_group: GroupConfig,

    #[serde(default)]
    pub partition_groups: HashMap<String, PartitionGroupConfig>,

    #[serde(default)]
    pub profiles: Vec<String>,

    #[serde(default)]
    pub raft: RaftConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,

    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            members: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_group_type")]
    pub group_type: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Log segment size for this group's partitions.
    #[serde(default = "default_segment_size", deserialize_with = "de_size")]
    pub segment_size: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_type: default_group_type(),
            partitions: default_partitions(),
            segment_size: default_segment_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionGroupConfig {
    #[serde(default = "default_group_type")]
    pub group_type: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_cluster_name() -> String {
    "keel".to_string()
}

fn default_group_type() -> String {
    "raft".to_string()
}

fn default_partitions() -> u32 {
    1
}

fn default_segment_size() -> u64 {
    16 * 1024 * 1024
}

impl ServerConfig {
    /// Loads and validates configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read config file: {e}")))?;
        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("failed to parse YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from environment variables.
    ///
    /// Supported:
    /// - `KEEL_NODE_ID`
    /// - `KEEL_DATA_DIR`
    /// - `KEEL_CLUSTER_NAME`
    /// - `KEEL_CLUSTER_MEMBERS` (comma-separated `id@host:port`)
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("KEEL_NODE_ID")
            .map_err(|_| ConfigError::MissingField("KEEL_NODE_ID".to_string()))?;
        let data_dir = std::env::var("KEEL_DATA_DIR")
            .map_err(|_| ConfigError::MissingField("KEEL_DATA_DIR".to_string()))?;

        let name = std::env::var("KEEL_CLUSTER_NAME").unwrap_or_else(|_| default_cluster_name());
        let members = std::env::var("KEEL_CLUSTER_MEMBERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| {
                        let (id, address) = s.trim().split_once('@').ok_or_else(|| {
                            ConfigError::InvalidField(format!(
                                "member '{s}' is not of the form id@host:port"
                            ))
                        })?;
                        Ok(MemberConfig {
                            id: id.to_string(),
                            address: address.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()
            })
            .transpose()?
            .unwrap_or_default();

        let config = ServerConfig {
            node_id,
            data_dir: PathBuf::from(data_dir),
            cluster: ClusterConfig { name, members },
            management_group: GroupConfig::default(),
            partition_groups: HashMap::new(),
            profiles: Vec::new(),
            raft: RaftConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::InvalidField(
                "node_id cannot be empty".to_string(),
            ));
        }
        if self.cluster.name.is_empty() {
            return Err(ConfigError::InvalidField(
                "cluster.name cannot be empty".to_string(),
            ));
        }
        for member in &self.cluster.members {
            member.address.parse::<SocketAddr>().map_err(|e| {
                ConfigError::InvalidField(format!(
                    "invalid address for member {}: {e}",
                    member.id
                ))
            })?;
        }
        if !self.cluster.members.is_empty()
            && !self.cluster.members.iter().any(|m| m.id == self.node_id)
        {
            return Err(ConfigError::InvalidField(format!(
                "node_id {} is not listed in cluster.members",
                self.node_id
            )));
        }
        if self.management_group.partitions == 0 {
            return Err(ConfigError::InvalidField(
                "management_group.partitions must be > 0".to_string(),
            ));
        }
        for (name, group) in &self.partition_groups {
            if group.partitions == 0 {
                return Err(ConfigError::InvalidField(format!(
                    "partition_groups.{name}.partitions must be > 0"
                )));
            }
        }
        self.raft.validate()
    }

    /// The cluster members as node ids, in configuration order.
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.cluster
            .members
            .iter()
            .map(|m| NodeId::new(m.id.clone()))
            .collect()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// Parses a size value with an optional `K`/`M`/`G` suffix.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }
    let (digits, multiplier) = match s.chars().last().unwrap() {
        'k' | 'K' => (&s[..s.len() - 1], 1024u64),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

fn de_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct SizeVisitor;

    impl serde::de::Visitor<'_> for SizeVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a byte count or a string with a K/M/G suffix")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("size cannot be negative"))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u64, E> {
            parse_size(v).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(SizeVisitor)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}
