//! Engine Configuration
//!
//! Every tunable the engine reads, with defaults. Configuration is usually
//! loaded from YAML:
//!
//! ```yaml
//! nodes:
//!   - id: node-a
//!     address: 10.0.0.1:6379
//!   - id: node-b
//!     address: 10.0.0.2:6379
//!     weight: 2
//! ring:
//!   replication_factor: 2
//! replication:
//!   write_quorum: 2
//!   operation_timeout: 1s
//! breaker:
//!   failure_threshold: 5
//!   cooldown: 1m
//! eviction:
//!   interval: 5m
//!   capacity_bytes: 1073741824
//! ```
//!
//! Durations accept `"250ms"`, `"30s"`, `"5m"`, `"1h30m"`, `"1d"` or a bare
//! number of seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string such as `"1h30m"`, `"250ms"` or `"45"` (seconds)
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if chars.peek().is_some_and(|n| *n == 's' || *n == 'S') => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms += num * multiplier;
    }

    // Trailing bare number means seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms += num * 1_000;
    }

    Ok(Duration::from_millis(total_ms))
}

fn format_duration(d: &Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

/// Serde adapter for human-readable durations
pub mod duration_str {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional human-readable durations
pub mod option_duration_str {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&format_duration(d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// =============================================================================
// Sections
// =============================================================================

/// A backend node declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    /// Virtual-node multiplier
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Consistent hash ring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Virtual points per unit of node weight
    pub virtual_nodes: u32,
    /// Nodes holding each key (primary + replicas)
    pub replication_factor: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: 256,
            replication_factor: 2,
        }
    }
}

/// Replica fan-out and consistency settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Acks required for set/delete; `None` means a majority of the replication factor
    pub write_quorum: Option<usize>,
    /// Replies gathered (and compared) on get
    pub read_quorum: usize,
    /// Deadline for a whole public operation
    #[serde(with = "duration_str")]
    pub operation_timeout: Duration,
    /// Reject operations when fewer than `replication_factor` candidates are healthy
    pub strict_topology: bool,
    /// After answering a read, check and repair the replicas that were not consulted
    pub repair_remaining: bool,
    /// Lifetime of delete tombstones
    #[serde(with = "duration_str")]
    pub tombstone_ttl: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            write_quorum: None,
            read_quorum: 1,
            operation_timeout: Duration::from_secs(1),
            strict_topology: false,
            repair_remaining: true,
            tombstone_ttl: Duration::from_secs(3600),
        }
    }
}

/// Per-node circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a probe
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
    /// Sliding window for the failure-rate rule
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// Calls needed in the window before the failure-rate rule applies
    pub min_calls_in_window: u32,
    /// Failure fraction in the window that opens the breaker
    pub failure_rate_threshold: f64,
    /// Deadline for a single backend call; a replica write (version check
    /// plus store) shares one such budget. Must be below `operation_timeout`.
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            window: Duration::from_secs(30),
            min_calls_in_window: 20,
            failure_rate_threshold: 0.5,
            call_timeout: Duration::from_millis(500),
        }
    }
}

/// Per-node connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent connections per node
    pub max_connections: usize,
    /// How long to wait for a free connection
    #[serde(with = "duration_str")]
    pub acquire_timeout: Duration,
    /// How long a node may stay down before its connections are closed
    #[serde(with = "duration_str")]
    pub down_grace_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout: Duration::from_millis(250),
            down_grace_period: Duration::from_secs(30),
        }
    }
}

/// Compression settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// Payloads smaller than this are stored uncompressed
    pub min_size_bytes: usize,
    /// Payloads at least this large use zlib instead of LZ4
    pub large_payload_threshold: usize,
    /// Compression level (algorithm-specific)
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
            large_payload_threshold: 256 * 1024,
            level: 6,
        }
    }
}

/// One encryption key
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyConfig {
    pub version: u32,
    pub secret: String,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("version", &self.version)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Encryption settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Known keys; the highest version encrypts unless `active_version` is set
    pub keys: Vec<KeyConfig>,
    pub active_version: Option<u32>,
    /// Salt for key derivation
    pub salt: String,
    /// Encrypt keys matching `sensitive_patterns` even when not requested
    pub encrypt_sensitive_keys: bool,
    pub sensitive_patterns: Vec<String>,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            active_version: None,
            salt: "ringcache".to_string(),
            encrypt_sensitive_keys: true,
            sensitive_patterns: [
                "password",
                "secret",
                "token",
                "key",
                "auth",
                "credential",
                "private",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Serialization pipeline settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub compression: CompressionSettings,
    pub encryption: EncryptionSettings,
}

/// Background eviction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Per-node storage budget; `None` disables pressure eviction
    pub capacity_bytes: Option<u64>,
    /// Usage fraction that starts pressure eviction
    pub high_watermark: f64,
    /// Usage fraction pressure eviction stops at
    pub low_watermark: f64,
    /// Keys fetched per backend round trip while scanning
    pub scan_batch: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            capacity_bytes: None,
            high_watermark: 0.90,
            low_watermark: 0.80,
            scan_batch: 256,
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber queue bound
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Input validation limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_key_len: usize,
    pub max_value_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_len: 250,
            max_value_size: 1024 * 1024,
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_str")]
    pub probe_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
        }
    }
}

/// Backup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub directory: PathBuf,
    /// Periodic backup interval; `None` disables periodic backups
    #[serde(with = "option_duration_str")]
    pub interval: Option<Duration>,
    /// Snapshots kept on disk
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("backups/cache"),
            interval: None,
            max_backups: 24,
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub nodes: Vec<NodeConfig>,
    pub ring: RingConfig,
    pub replication: ReplicationConfig,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
    pub eviction: EvictionConfig,
    pub bus: BusConfig,
    pub limits: LimitsConfig,
    pub health: HealthConfig,
    pub backup: BackupConfig,
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Effective write quorum
    pub fn write_quorum(&self) -> usize {
        self.replication
            .write_quorum
            .unwrap_or(self.ring.replication_factor / 2 + 1)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let rf = self.ring.replication_factor;
        if rf == 0 {
            return Err(Error::Config("replication_factor must be at least 1".into()));
        }
        if self.ring.virtual_nodes == 0 {
            return Err(Error::Config("virtual_nodes must be at least 1".into()));
        }
        let w = self.write_quorum();
        if w == 0 || w > rf {
            return Err(Error::Config(format!(
                "write_quorum {} must be between 1 and replication_factor {}",
                w, rf
            )));
        }
        let r = self.replication.read_quorum;
        if r == 0 || r > rf {
            return Err(Error::Config(format!(
                "read_quorum {} must be between 1 and replication_factor {}",
                r, rf
            )));
        }
        let (lo, hi) = (self.eviction.low_watermark, self.eviction.high_watermark);
        if !(0.0 < lo && lo < hi && hi <= 1.0) {
            return Err(Error::Config(format!(
                "watermarks must satisfy 0 < low ({}) < high ({}) <= 1",
                lo, hi
            )));
        }
        let rate = self.breaker.failure_rate_threshold;
        if !(0.0 < rate && rate <= 1.0) {
            return Err(Error::Config(format!(
                "failure_rate_threshold {} must be in (0, 1]",
                rate
            )));
        }
        if self.breaker.call_timeout >= self.replication.operation_timeout {
            return Err(Error::Config(format!(
                "call_timeout {:?} must be shorter than operation_timeout {:?}",
                self.breaker.call_timeout, self.replication.operation_timeout
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be at least 1".into()));
        }
        if self.pool.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.bus.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(Error::Config("node id must not be empty".into()));
            }
            if node.weight == 0 {
                return Err(Error::Config(format!("node {} has zero weight", node.id)));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(Error::Config(format!("duplicate node id {}", node.id)));
            }
        }
        for key in &self.pipeline.encryption.keys {
            if key.secret.is_empty() {
                return Err(Error::Config(format!(
                    "encryption key version {} has an empty secret",
                    key.version
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m500ms").unwrap(), Duration::from_millis(60_500));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("s"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.write_quorum(), 2);
        assert_eq!(config.replication.read_quorum, 1);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
nodes:
  - id: a
    address: 127.0.0.1:7001
  - id: b
    address: 127.0.0.1:7002
    weight: 3
ring:
  replication_factor: 2
replication:
  write_quorum: 1
  operation_timeout: 750ms
breaker:
  failure_threshold: 3
  cooldown: 10s
backup:
  interval: 1h
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].weight, 1);
        assert_eq!(config.nodes[1].weight, 3);
        assert_eq!(config.write_quorum(), 1);
        assert_eq!(
            config.replication.operation_timeout,
            Duration::from_millis(750)
        );
        assert_eq!(config.breaker.cooldown, Duration::from_secs(10));
        assert_eq!(config.backup.interval, Some(Duration::from_secs(3600)));
        // untouched sections keep their defaults
        assert_eq!(config.ring.virtual_nodes, 256);
    }

    #[test]
    fn test_validation_rejects_bad_quorum() {
        let yaml = r#"
ring:
  replication_factor: 2
replication:
  write_quorum: 3
"#;
        assert_matches!(EngineConfig::from_yaml(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_call_timeout_past_operation_timeout() {
        let yaml = r#"
replication:
  operation_timeout: 1s
breaker:
  call_timeout: 1s
"#;
        assert_matches!(EngineConfig::from_yaml(yaml), Err(Error::Config(_)));

        let mut config = EngineConfig::default();
        config.replication.operation_timeout = Duration::from_millis(300);
        assert_matches!(config.validate(), Err(Error::Config(_)));
        config.breaker.call_timeout = Duration::from_millis(100);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_duplicate_nodes() {
        let mut config = EngineConfig::default();
        config.nodes = vec![NodeConfig::new("a", "x"), NodeConfig::new("a", "y")];
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_key_secret_redacted_in_debug() {
        let key = KeyConfig {
            version: 1,
            secret: "hunter2".into(),
        };
        let debug = format!("{:?}", key);
        assert!(!debug.contains("hunter2"));
    }
}
