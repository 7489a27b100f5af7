//! Runtime configuration
//!
//! Every tunable is an explicit field here; there are no hidden
//! environment-only knobs. Values come from an optional TOML file and may be
//! overridden by CLI flags in `main`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};

/// Whether eventually-consistent reads may be served from replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    /// All reads go to the primary.
    PrimaryOnly,
    /// Eventual reads round-robin over healthy replicas.
    ReplicaOk,
}

/// Per-metric thresholds for hot/cold shard classification.
///
/// A shard is hot when any metric exceeds its `max_*` threshold and cold when
/// every metric sits below its `min_*` threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleThresholds {
    pub max_query_rate: f64,
    pub max_cpu_usage: f64,
    pub max_memory_usage: f64,
    pub max_storage_usage: f64,
    pub max_connections: f64,
    pub max_latency_ms: f64,

    pub min_query_rate: f64,
    pub min_cpu_usage: f64,
    pub min_memory_usage: f64,
    pub min_storage_usage: f64,
    pub min_connections: f64,
    pub min_latency_ms: f64,
}

impl Default for AutoscaleThresholds {
    fn default() -> Self {
        Self {
            max_query_rate: 10_000.0,
            max_cpu_usage: 80.0,
            max_memory_usage: 80.0,
            max_storage_usage: 80.0,
            max_connections: 1_000.0,
            max_latency_ms: 100.0,

            min_query_rate: 100.0,
            min_cpu_usage: 10.0,
            min_memory_usage: 20.0,
            min_storage_usage: 20.0,
            min_connections: 10.0,
            min_latency_ms: 10.0,
        }
    }
}

/// Settings for the reshard executor and its SQL data mover.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshardConfig {
    /// Rows copied per batch during precopy and deltasync.
    pub batch_size: usize,
    /// Precopy wall-clock budget; exceeding it fails the job.
    pub precopy_timeout_secs: u64,
    /// Deltasync converges when a delta round replays at most this many rows.
    pub cutover_lag_rows: u64,
    /// Maximum deltasync rounds before the job fails.
    pub max_delta_rounds: u32,
    /// Table holding the sharded rows.
    pub data_table: String,
    /// Column carrying the shard key.
    pub key_column: String,
    /// Column used as the change-capture watermark.
    pub change_column: String,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            precopy_timeout_secs: 3_600,
            cutover_lag_rows: 100,
            max_delta_rounds: 100,
            data_table: "records".to_string(),
            key_column: "shard_key".to_string(),
            change_column: "updated_at".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ring hash function. Only "murmur3" is recognized; the choice is part
    /// of the wire contract and must not change once a catalog exists.
    pub hash_function: String,
    /// Virtual nodes assigned to each new shard.
    pub vnode_count: u32,
    pub replica_policy: ReplicaPolicy,

    /// Per-endpoint connection pool bound.
    pub max_connections: usize,
    /// Idle connections older than this are retired on release.
    pub connection_ttl_secs: u64,
    /// How long an `execute` waits for a pooled connection.
    pub acquire_timeout_ms: u64,
    /// Default deadline for data-plane requests without an explicit one.
    pub request_timeout_ms: u64,

    /// Health probe cadence.
    pub probe_interval_secs: u64,
    /// Consecutive failed primary probes before a shard is unhealthy.
    pub failure_threshold: u32,
    pub replication_lag_threshold_ms: u64,
    /// Per-shard quiet period after a failover.
    pub failover_cooldown_secs: u64,

    /// Load sampling cadence.
    pub sample_interval_secs: u64,
    /// Auto-split decision cadence.
    pub decision_interval_secs: u64,
    /// Per-shard quiet period after an automatic split.
    pub split_cooldown_secs: u64,

    /// Bounded retry attempts on catalog version conflicts.
    pub retry_attempts: u32,
    /// Tenant usage counters are flushed to the catalog at this cadence.
    pub tenant_flush_interval_secs: u64,

    pub autoscale: AutoscaleThresholds,
    pub reshard: ReshardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_function: "murmur3".to_string(),
            vnode_count: 256,
            replica_policy: ReplicaPolicy::ReplicaOk,

            max_connections: 100,
            connection_ttl_secs: 300,
            acquire_timeout_ms: 5_000,
            request_timeout_ms: 30_000,

            probe_interval_secs: 30,
            failure_threshold: 2,
            replication_lag_threshold_ms: 1_000,
            failover_cooldown_secs: 300,

            sample_interval_secs: 10,
            decision_interval_secs: 60,
            split_cooldown_secs: 1_800,

            retry_attempts: 3,
            tenant_flush_interval_secs: 30,

            autoscale: AutoscaleThresholds::default(),
            reshard: ReshardConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// missing field.
    pub fn from_file(path: &str) -> ShardResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| ShardError::Validation(format!("invalid config file {}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.hash_function != "murmur3" {
            return Err(ShardError::Validation(format!(
                "unsupported hash_function '{}'",
                self.hash_function
            )));
        }
        if self.vnode_count == 0 {
            return Err(ShardError::Validation("vnode_count must be > 0".into()));
        }
        if self.max_connections == 0 {
            return Err(ShardError::Validation("max_connections must be > 0".into()));
        }
        if self.retry_attempts == 0 {
            return Err(ShardError::Validation("retry_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn replication_lag_threshold(&self) -> Duration {
        Duration::from_millis(self.replication_lag_threshold_ms)
    }

    pub fn failover_cooldown(&self) -> Duration {
        Duration::from_secs(self.failover_cooldown_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn decision_interval(&self) -> Duration {
        Duration::from_secs(self.decision_interval_secs)
    }

    pub fn split_cooldown(&self) -> Duration {
        Duration::from_secs(self.split_cooldown_secs)
    }

    pub fn precopy_timeout(&self) -> Duration {
        Duration::from_secs(self.reshard.precopy_timeout_secs)
    }
}
