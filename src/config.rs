//! Cluster configuration.
//!
//! One file configures every role; each process reads only its own section plus
//! `cluster`. Sources, highest priority first:
//! 1. Command-line flags (applied by the binary)
//! 2. Environment variables (prefix: `SHARDKV__`)
//! 3. Configuration file (TOML)
//! 4. Built-in defaults
//!
//! # Environment Variables
//!
//! - `SHARDKV__CLUSTER__DISCOVERY_URL=http://10.0.0.1:7000`
//! - `SHARDKV__MASTER__SHARD_COUNT=64`
//! - `SHARDKV__NODE__HEARTBEAT_INTERVAL_MS=250`
//! - `SHARDKV__LOGGING__LEVEL=debug`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "SHARDKV";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    pub discovery: DiscoveryConfig,
    pub master: MasterConfig,
    pub node: NodeConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

impl ClusterConfig {
    /// Loads an optional TOML file, then applies `SHARDKV__*` overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path
            && Path::new(file_path).exists()
        {
            let contents = std::fs::read_to_string(file_path)?;
            config = toml::from_str(&contents)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let c = &mut self.cluster;
        env_override(&mut c.discovery_url, "CLUSTER", "DISCOVERY_URL");
        env_override(&mut c.master_url, "CLUSTER", "MASTER_URL");
        env_override(&mut c.request_timeout_ms, "CLUSTER", "REQUEST_TIMEOUT_MS");
        env_override(&mut c.request_attempts, "CLUSTER", "REQUEST_ATTEMPTS");

        let d = &mut self.discovery;
        env_override(&mut d.listen, "DISCOVERY", "LISTEN");
        env_override(&mut d.heartbeat_deadline_ms, "DISCOVERY", "HEARTBEAT_DEADLINE_MS");
        env_override(&mut d.dead_after_missed, "DISCOVERY", "DEAD_AFTER_MISSED");
        env_override(&mut d.suspect_grace_ms, "DISCOVERY", "SUSPECT_GRACE_MS");
        env_override(&mut d.sweep_interval_ms, "DISCOVERY", "SWEEP_INTERVAL_MS");

        let m = &mut self.master;
        env_override(&mut m.listen, "MASTER", "LISTEN");
        env_override(&mut m.shard_count, "MASTER", "SHARD_COUNT");
        env_override(&mut m.bootstrap_min_nodes, "MASTER", "BOOTSTRAP_MIN_NODES");
        env_override(&mut m.reconcile_interval_ms, "MASTER", "RECONCILE_INTERVAL_MS");
        env_override(&mut m.max_inbound_migrations, "MASTER", "MAX_INBOUND_MIGRATIONS");
        env_override(&mut m.catch_up_timeout_ms, "MASTER", "CATCH_UP_TIMEOUT_MS");
        env_override(&mut m.task_history, "MASTER", "TASK_HISTORY");
        if let Some(path) = env_value::<String>("MASTER", "COMMIT_LOG") {
            m.commit_log = Some(path);
        }

        let n = &mut self.node;
        env_override(&mut n.id, "NODE", "ID");
        env_override(&mut n.listen, "NODE", "LISTEN");
        if let Some(advertise) = env_value::<String>("NODE", "ADVERTISE") {
            n.advertise = Some(advertise);
        }
        env_override(&mut n.heartbeat_interval_ms, "NODE", "HEARTBEAT_INTERVAL_MS");
        env_override(&mut n.map_sync_interval_ms, "NODE", "MAP_SYNC_INTERVAL_MS");
        env_override(&mut n.snapshot_chunk, "NODE", "SNAPSHOT_CHUNK");
        env_override(&mut n.delta_batch, "NODE", "DELTA_BATCH");
        env_override(&mut n.delta_flush_ms, "NODE", "DELTA_FLUSH_MS");
        env_override(&mut n.catch_up_lag_threshold, "NODE", "CATCH_UP_LAG_THRESHOLD");

        let cl = &mut self.client;
        env_override(&mut cl.max_attempts, "CLIENT", "MAX_ATTEMPTS");
        env_override(&mut cl.backoff_initial_ms, "CLIENT", "BACKOFF_INITIAL_MS");
        env_override(&mut cl.backoff_max_ms, "CLIENT", "BACKOFF_MAX_MS");

        env_override(&mut self.logging.level, "LOGGING", "LEVEL");
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.master.shard_count == 0 {
            return Err(ConfigError::Invalid("master.shard_count must be > 0".into()));
        }
        if self.discovery.dead_after_missed == 0 {
            return Err(ConfigError::Invalid(
                "discovery.dead_after_missed must be > 0".into(),
            ));
        }
        if self.master.max_inbound_migrations == 0 {
            return Err(ConfigError::Invalid(
                "master.max_inbound_migrations must be > 0".into(),
            ));
        }
        if self.client.max_attempts == 0 {
            return Err(ConfigError::Invalid("client.max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn env_value<T: FromStr>(section: &str, field: &str) -> Option<T> {
    std::env::var(format!("{}__{}__{}", ENV_PREFIX, section, field))
        .ok()
        .and_then(|raw| raw.parse().ok())
}

fn env_override<T: FromStr>(target: &mut T, section: &str, field: &str) {
    if let Some(value) = env_value(section, field) {
        *target = value;
    }
}

/// Where the shared services live and how hard to try reaching them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub discovery_url: String,
    pub master_url: String,
    pub request_timeout_ms: u64,
    /// Transport-level attempts per RPC before a `Timeout`/`Transport` error surfaces.
    pub request_attempts: usize,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            discovery_url: "http://127.0.0.1:7000".to_string(),
            master_url: "http://127.0.0.1:7100".to_string(),
            request_timeout_ms: 2_000,
            request_attempts: 3,
        }
    }
}

impl ClusterSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub listen: String,
    /// A node that has not heartbeated for this long misses one deadline.
    pub heartbeat_deadline_ms: u64,
    /// Consecutive missed deadlines before a node is declared dead.
    pub dead_after_missed: u32,
    /// Time spent `Suspect` before a node is declared dead.
    pub suspect_grace_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7000".to_string(),
            heartbeat_deadline_ms: 1_500,
            dead_after_missed: 3,
            suspect_grace_ms: 5_000,
            sweep_interval_ms: 250,
        }
    }
}

impl DiscoveryConfig {
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_millis(self.heartbeat_deadline_ms)
    }

    pub fn suspect_grace(&self) -> Duration {
        Duration::from_millis(self.suspect_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen: String,
    /// Fixed for the life of the cluster.
    pub shard_count: u32,
    /// Alive nodes required before the first map is committed.
    pub bootstrap_min_nodes: usize,
    pub reconcile_interval_ms: u64,
    /// Admission limit on concurrent inbound migrations per destination.
    pub max_inbound_migrations: usize,
    /// A migration that has not caught up within this window is aborted.
    pub catch_up_timeout_ms: u64,
    /// Archived tasks retained for `Status`.
    pub task_history: usize,
    /// Append-only commit log. In-memory when unset.
    pub commit_log: Option<String>,
    /// Failed rollback attempts before an alert is raised.
    pub rollback_alert_after: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7100".to_string(),
            shard_count: 16,
            bootstrap_min_nodes: 1,
            reconcile_interval_ms: 500,
            max_inbound_migrations: 2,
            catch_up_timeout_ms: 30_000,
            task_history: 128,
            commit_log: None,
            rollback_alert_after: 3,
        }
    }
}

impl MasterConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: u64,
    pub listen: String,
    /// Address other roles use to reach this node. Defaults to `listen`.
    pub advertise: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub map_sync_interval_ms: u64,
    /// Entries per `InstallSnapshot` call.
    pub snapshot_chunk: usize,
    /// Operations per `ApplyDelta` call.
    pub delta_batch: usize,
    pub delta_flush_ms: u64,
    /// Pending delta operations at or below which the destination counts as caught up.
    pub catch_up_lag_threshold: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            listen: "127.0.0.1:7201".to_string(),
            advertise: None,
            heartbeat_interval_ms: 500,
            map_sync_interval_ms: 1_000,
            snapshot_chunk: 512,
            delta_batch: 256,
            delta_flush_ms: 20,
            catch_up_lag_threshold: 16,
        }
    }
}

impl NodeConfig {
    pub fn advertise_address(&self) -> String {
        self.advertise.clone().unwrap_or_else(|| self.listen.clone())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn map_sync_interval(&self) -> Duration {
        Duration::from_millis(self.map_sync_interval_ms)
    }

    pub fn delta_flush(&self) -> Duration {
        Duration::from_millis(self.delta_flush_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Attempts per request, counting the first. `NotOwner` on the last one is surfaced.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_initial_ms: 50,
            backoff_max_ms: 800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
