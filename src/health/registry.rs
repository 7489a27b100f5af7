//! Shared view of shard health
//!
//! The health controller writes probe results here; the router reads them
//! for replica selection. Endpoints with no recorded state are assumed
//! healthy until proven otherwise.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Probe outcome for one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardHealth {
    pub shard_id: String,
    pub primary_up: bool,
    /// Endpoint addrs of replicas that answered the probe.
    pub replicas_up: Vec<String>,
    pub replicas_down: Vec<String>,
    /// Per-replica replication lag in milliseconds.
    pub replica_lags: HashMap<String, u64>,
    /// Worst lag among live replicas.
    pub replication_lag_ms: u64,
    pub last_check: DateTime<Utc>,
    pub status: HealthStatus,
}

/// A completed failover, kept for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub shard_id: String,
    pub old_primary: String,
    pub new_primary: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct HealthRegistry {
    shards: RwLock<HashMap<String, ShardHealth>>,
    failovers: RwLock<Vec<FailoverEvent>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, health: ShardHealth) {
        self.shards.write().insert(health.shard_id.clone(), health);
    }

    pub fn get(&self, shard_id: &str) -> Option<ShardHealth> {
        self.shards.read().get(shard_id).cloned()
    }

    pub fn all(&self) -> Vec<ShardHealth> {
        let mut all: Vec<ShardHealth> = self.shards.read().values().cloned().collect();
        all.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        all
    }

    /// Drop state for shards no longer in the catalog.
    pub fn retain(&self, keep: &dyn Fn(&str) -> bool) {
        self.shards.write().retain(|id, _| keep(id));
    }

    /// Whether a replica may serve eventual reads. Unknown shards and
    /// unknown replicas default to healthy.
    pub fn is_replica_healthy(&self, shard_id: &str, addr: &str) -> bool {
        match self.shards.read().get(shard_id) {
            Some(health) => !health.replicas_down.iter().any(|a| a == addr),
            None => true,
        }
    }

    pub fn record_failover(&self, event: FailoverEvent) {
        self.failovers.write().push(event);
    }

    pub fn failover_history(&self) -> Vec<FailoverEvent> {
        self.failovers.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(shard_id: &str, down: &[&str]) -> ShardHealth {
        ShardHealth {
            shard_id: shard_id.to_string(),
            primary_up: true,
            replicas_up: vec![],
            replicas_down: down.iter().map(|s| s.to_string()).collect(),
            replica_lags: HashMap::new(),
            replication_lag_ms: 0,
            last_check: Utc::now(),
            status: HealthStatus::Healthy,
        }
    }

    #[test]
    fn test_unknown_shard_defaults_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.is_replica_healthy("shard-x", "db1:5432/app"));
    }

    #[test]
    fn test_down_replica_is_not_healthy() {
        let registry = HealthRegistry::new();
        registry.record(health("shard-a", &["db2:5432/app"]));

        assert!(!registry.is_replica_healthy("shard-a", "db2:5432/app"));
        assert!(registry.is_replica_healthy("shard-a", "db3:5432/app"));
    }

    #[test]
    fn test_record_overwrites_previous_state() {
        let registry = HealthRegistry::new();
        registry.record(health("shard-a", &["db2:5432/app"]));
        registry.record(health("shard-a", &[]));

        assert!(registry.is_replica_healthy("shard-a", "db2:5432/app"));
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_retain_drops_removed_shards() {
        let registry = HealthRegistry::new();
        registry.record(health("shard-a", &[]));
        registry.record(health("shard-b", &[]));

        registry.retain(&|id| id == "shard-a");
        assert!(registry.get("shard-a").is_some());
        assert!(registry.get("shard-b").is_none());
    }

    #[test]
    fn test_failover_history_accumulates() {
        let registry = HealthRegistry::new();
        registry.record_failover(FailoverEvent {
            shard_id: "shard-a".into(),
            old_primary: "db1:5432/app".into(),
            new_primary: "db2:5432/app".into(),
            reason: "primary down for 2 probes".into(),
            at: Utc::now(),
        });
        assert_eq!(registry.failover_history().len(), 1);
    }
}
