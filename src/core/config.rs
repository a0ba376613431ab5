//! Configuration parsing and validation.
//!
//! Tessera configuration is loaded from a TOML file, validated, and then
//! adjusted by CLI overrides. Every section except `member` and `cluster`
//! has defaults.

use crate::raft::{MemberInfo, NodeId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this member.
    pub member: MemberConfig,

    /// Bootstrap membership and Raft timing.
    pub cluster: ClusterConfig,

    /// Client and peer listeners.
    #[serde(default)]
    pub listeners: ListenerConfig,

    /// Log and snapshot persistence.
    #[serde(default)]
    pub durability: DurabilityConfig,

    /// Key-value state machine tuning.
    #[serde(default)]
    pub kv: KvConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Client request handling.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Non-zero member id, unique in the cluster.
    pub id: NodeId,

    /// Human-readable member name.
    #[serde(default = "default_member_name")]
    pub name: String,

    /// Root of the `wal/` and `snap/` directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Reported in every response header.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: u64,
}

/// A bootstrap member entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialMember {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    /// Address peers dial for Raft traffic.
    pub peer_addr: String,
    /// Address clients dial.
    #[serde(default)]
    pub client_addr: String,
}

impl InitialMember {
    pub fn to_member_info(&self) -> MemberInfo {
        MemberInfo::new(self.id, self.name.clone(), self.peer_addr.clone())
            .with_client_addr(self.client_addr.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Voters used when no snapshot holds a membership. A member joining an
    /// existing cluster leaves this empty and waits to be added.
    #[serde(default)]
    pub initial_members: Vec<InitialMember>,

    /// Raft tick period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Election timeout in ticks; randomized up to twice this value.
    #[serde(default = "default_election_ticks")]
    pub election_ticks: u32,

    #[serde(default = "default_heartbeat_ticks")]
    pub heartbeat_ticks: u32,

    /// Upper bound on entry bytes in one append message.
    #[serde(default = "default_max_append_bytes")]
    pub max_append_bytes: usize,

    /// Outbound message queue depth per peer.
    #[serde(default = "default_peer_queue")]
    pub peer_queue: usize,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// etcd v3 gRPC bind address.
    #[serde(default = "default_client_bind")]
    pub client_bind: String,

    /// Peer (Raft) gRPC bind address.
    #[serde(default = "default_peer_bind")]
    pub peer_bind: String,

    /// PEM certificate chain for the client listener.
    #[serde(default)]
    pub tls_chain_path: Option<String>,

    /// PEM private key for the client listener.
    #[serde(default)]
    pub tls_key_path: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            client_bind: default_client_bind(),
            peer_bind: default_peer_bind(),
            tls_chain_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// fsync every append batch.
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Roll over to a new WAL segment past this size.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Snapshot after this many applied entries.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Snapshot files kept on disk.
    #[serde(default = "default_snapshots_retained")]
    pub snapshots_retained: usize,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            fsync: true,
            segment_max_bytes: default_segment_max_bytes(),
            snapshot_interval: default_snapshot_interval(),
            snapshots_retained: default_snapshots_retained(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Queue depth of each watch observer before it is disconnected.
    #[serde(default = "default_watch_queue")]
    pub watch_queue: usize,

    /// How often the leader commits a time tick, in milliseconds.
    #[serde(default = "default_lease_tick_ms")]
    pub lease_tick_ms: u64,

    /// Largest TTL a lease may be granted, in seconds.
    #[serde(default = "default_max_lease_ttl")]
    pub max_lease_ttl: i64,

    /// Revisions retained by auto-compaction; 0 disables it.
    #[serde(default)]
    pub compaction_retention: i64,

    /// Auto-compaction check period in seconds.
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Requests remembered for duplicate detection. Must be equal on every
    /// member.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            watch_queue: default_watch_queue(),
            lease_tick_ms: default_lease_tick_ms(),
            max_lease_ttl: default_max_lease_ttl(),
            compaction_retention: 0,
            compaction_interval_secs: default_compaction_interval_secs(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime of issued tokens in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Time allowed for one proposal attempt to be applied.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// First retry delay for unavailable errors.
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Largest retry delay.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Total time spent retrying before the error is returned.
    #[serde(default = "default_retry_budget_ms")]
    pub retry_budget_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_budget_ms: default_retry_budget_ms(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_member_name() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_cluster_id() -> u64 {
    1
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_election_ticks() -> u32 {
    10
}

fn default_heartbeat_ticks() -> u32 {
    1
}

fn default_max_append_bytes() -> usize {
    1024 * 1024
}

fn default_peer_queue() -> usize {
    256
}

fn default_client_bind() -> String {
    "127.0.0.1:2379".to_string()
}

fn default_peer_bind() -> String {
    "127.0.0.1:2380".to_string()
}

fn default_true() -> bool {
    true
}

fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_snapshot_interval() -> u64 {
    10_000
}

fn default_snapshots_retained() -> usize {
    3
}

fn default_watch_queue() -> usize {
    1024
}

fn default_lease_tick_ms() -> u64 {
    500
}

fn default_max_lease_ttl() -> i64 {
    9_000_000_000
}

fn default_compaction_interval_secs() -> u64 {
    300
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_retry_initial_ms() -> u64 {
    50
}

fn default_retry_max_ms() -> u64 {
    1_000
}

fn default_retry_budget_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// A single-member configuration rooted at `data_dir`.
    pub fn single_member(id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        let listeners = ListenerConfig::default();
        Self {
            member: MemberConfig {
                id,
                name: format!("member-{}", id),
                data_dir: data_dir.into(),
                cluster_id: default_cluster_id(),
            },
            cluster: ClusterConfig {
                initial_members: vec![InitialMember {
                    id,
                    name: format!("member-{}", id),
                    peer_addr: format!("http://{}", listeners.peer_bind),
                    client_addr: format!("http://{}", listeners.client_bind),
                }],
                tick_interval_ms: default_tick_interval_ms(),
                election_ticks: default_election_ticks(),
                heartbeat_ticks: default_heartbeat_ticks(),
                max_append_bytes: default_max_append_bytes(),
                peer_queue: default_peer_queue(),
            },
            listeners,
            durability: DurabilityConfig::default(),
            kv: KvConfig::default(),
            auth: AuthConfig::default(),
            rpc: RpcConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.member.data_dir = data_dir.clone();
        }
    }

    pub fn initial_members(&self) -> Vec<MemberInfo> {
        self.cluster
            .initial_members
            .iter()
            .map(InitialMember::to_member_info)
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.tick_interval_ms)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_member()?;
        self.validate_cluster()?;
        self.validate_kv()?;
        self.validate_telemetry()?;
        self.validate_listeners()?;
        Ok(())
    }

    fn validate_member(&self) -> Result<()> {
        if self.member.id == 0 {
            anyhow::bail!("member.id must be > 0");
        }
        if self.member.data_dir.as_os_str().is_empty() {
            anyhow::bail!("member.data_dir must not be empty");
        }
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        let c = &self.cluster;
        if c.tick_interval_ms == 0 {
            anyhow::bail!("cluster.tick_interval_ms must be > 0");
        }
        if c.heartbeat_ticks == 0 || c.election_ticks <= c.heartbeat_ticks {
            anyhow::bail!(
                "cluster.election_ticks ({}) must exceed cluster.heartbeat_ticks ({}) and both must be > 0",
                c.election_ticks,
                c.heartbeat_ticks
            );
        }
        let mut seen = std::collections::HashSet::new();
        for m in &c.initial_members {
            if m.id == 0 {
                anyhow::bail!("cluster.initial_members: member id must be > 0");
            }
            if !seen.insert(m.id) {
                anyhow::bail!("cluster.initial_members: duplicate member id {}", m.id);
            }
            if m.peer_addr.is_empty() {
                anyhow::bail!("cluster.initial_members: member {} has no peer_addr", m.id);
            }
        }
        if !c.initial_members.is_empty() && !seen.contains(&self.member.id) {
            anyhow::bail!(
                "member.id {} is not listed in cluster.initial_members",
                self.member.id
            );
        }
        Ok(())
    }

    fn validate_kv(&self) -> Result<()> {
        if self.kv.watch_queue == 0 {
            anyhow::bail!("kv.watch_queue must be > 0");
        }
        if self.kv.lease_tick_ms == 0 {
            anyhow::bail!("kv.lease_tick_ms must be > 0");
        }
        if self.kv.max_lease_ttl <= 0 {
            anyhow::bail!("kv.max_lease_ttl must be > 0");
        }
        if self.kv.compaction_retention < 0 {
            anyhow::bail!("kv.compaction_retention must not be negative");
        }
        if self.kv.dedup_capacity == 0 {
            anyhow::bail!("kv.dedup_capacity must be > 0");
        }
        if self.rpc.retry_initial_ms > self.rpc.retry_max_ms {
            anyhow::bail!(
                "rpc.retry_initial_ms ({}) cannot exceed rpc.retry_max_ms ({})",
                self.rpc.retry_initial_ms,
                self.rpc.retry_max_ms
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_listeners(&self) -> Result<()> {
        let l = &self.listeners;
        match (&l.tls_chain_path, &l.tls_key_path) {
            (Some(_), None) => {
                anyhow::bail!("listeners.tls_key_path required when tls_chain_path is set")
            }
            (None, Some(_)) => {
                anyhow::bail!("listeners.tls_chain_path required when tls_key_path is set")
            }
            _ => {}
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override data directory.
    pub data_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[member]
id = 2
name = "b"
data_dir = "/var/lib/tessera"

[cluster]
initial_members = [
    { id = 1, peer_addr = "http://10.0.0.1:2380" },
    { id = 2, peer_addr = "http://10.0.0.2:2380" },
    { id = 3, peer_addr = "http://10.0.0.3:2380" },
]

[kv]
compaction_retention = 1000
"#;

    #[test]
    fn parses_with_defaults() {
        let cfg = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.member.id, 2);
        assert_eq!(cfg.initial_members().len(), 3);
        assert_eq!(cfg.kv.compaction_retention, 1000);
        assert_eq!(cfg.kv.lease_tick_ms, 500);
        assert_eq!(cfg.cluster.election_ticks, 10);
        assert!(cfg.durability.fsync);
    }

    #[test]
    fn rejects_member_outside_initial_set() {
        let bad = SAMPLE.replace("id = 2\nname", "id = 9\nname");
        let err = Config::from_toml(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("not listed"));
    }

    #[test]
    fn rejects_half_configured_tls() {
        let mut cfg = Config::single_member(1, "/tmp/x");
        cfg.listeners.tls_chain_path = Some("chain.pem".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_apply_after_load() {
        let mut cfg = Config::from_toml(SAMPLE).unwrap();
        cfg.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".into()),
            data_dir: Some("/tmp/override".into()),
        });
        assert_eq!(cfg.telemetry.log_level, "debug");
        assert_eq!(cfg.member.data_dir, PathBuf::from("/tmp/override"));
    }

    #[test]
    fn single_member_round_trips_through_toml() {
        let cfg = Config::single_member(4, "/tmp/d");
        let text = cfg.to_toml().unwrap();
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.member.id, 4);
        assert_eq!(back.initial_members()[0].id, 4);
    }
}
