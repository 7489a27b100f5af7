//! Periodic shard probing and automatic failover
//!
//! Every probe interval the controller pings each routable shard's primary
//! and replicas, measures replication lag, and publishes a `ShardHealth`
//! record. A primary that misses two consecutive probes makes the shard
//! unhealthy; the controller then promotes the lowest-lag live replica,
//! subject to a per-shard cooldown against flapping.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::registry::{FailoverEvent, HealthRegistry, HealthStatus, ShardHealth};
use crate::catalog::model::{Endpoint, Shard};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::ShardError;
use crate::manager::ShardManager;
use crate::pool::Connector;

pub struct HealthController {
    catalog: Arc<Catalog>,
    connector: Arc<dyn Connector>,
    manager: Arc<ShardManager>,
    registry: Arc<HealthRegistry>,
    config: Arc<Config>,
    /// Consecutive failed primary probes per shard.
    failures: DashMap<String, u32>,
    /// Last failover time per shard.
    cooldowns: DashMap<String, Instant>,
}

impl HealthController {
    pub fn new(
        catalog: Arc<Catalog>,
        connector: Arc<dyn Connector>,
        manager: Arc<ShardManager>,
        registry: Arc<HealthRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog,
            connector,
            manager,
            registry,
            config,
            failures: DashMap::new(),
            cooldowns: DashMap::new(),
        }
    }

    /// Background loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("health controller stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full probe pass over every routable shard.
    pub async fn probe_all(&self) {
        let snapshot = self.catalog.snapshot();
        let shard_ids: Vec<String> = snapshot.shards.keys().cloned().collect();
        self.registry.retain(&|id| shard_ids.iter().any(|s| s == id));

        for shard in snapshot.shards.values() {
            if !shard.status.is_routable() {
                continue;
            }
            self.probe_shard(shard).await;
        }
    }

    /// Ping one endpoint and read its replication lag.
    async fn probe_endpoint(&self, endpoint: &Endpoint) -> Option<u64> {
        let mut conn = match self.connector.connect(endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("probe connect to {} failed: {}", endpoint.addr(), e);
                return None;
            }
        };
        if conn.ping().await.is_err() {
            return None;
        }
        match conn.replication_lag().await {
            Ok(lag) => Some(lag.as_millis() as u64),
            Err(_) => Some(0),
        }
    }

    async fn probe_shard(&self, shard: &Shard) {
        let primary_up = self.probe_endpoint(&shard.primary).await.is_some();
        let consecutive = if primary_up {
            self.failures.remove(&shard.id);
            0
        } else {
            let mut entry = self.failures.entry(shard.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let mut replicas_up = Vec::new();
        let mut replicas_down = Vec::new();
        let mut replica_lags = std::collections::HashMap::new();
        for replica in &shard.replicas {
            let addr = replica.addr();
            match self.probe_endpoint(replica).await {
                Some(lag_ms) => {
                    replica_lags.insert(addr.clone(), lag_ms);
                    replicas_up.push(addr);
                }
                None => replicas_down.push(addr),
            }
        }
        let worst_lag = replica_lags.values().copied().max().unwrap_or(0);

        // A shard is also unhealthy when the read policy depends on
        // replicas and every replica is gone.
        let replicas_exhausted = self.config.replica_policy == crate::config::ReplicaPolicy::ReplicaOk
            && !shard.replicas.is_empty()
            && replicas_up.is_empty();
        let unhealthy = consecutive >= self.config.failure_threshold || replicas_exhausted;
        let status = if unhealthy {
            HealthStatus::Unhealthy
        } else if !primary_up
            || !replicas_down.is_empty()
            || worst_lag > self.config.replication_lag_threshold().as_millis() as u64
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        self.registry.record(ShardHealth {
            shard_id: shard.id.clone(),
            primary_up,
            replicas_up,
            replicas_down,
            replica_lags: replica_lags.clone(),
            replication_lag_ms: worst_lag,
            last_check: Utc::now(),
            status,
        });

        if unhealthy && !primary_up {
            self.maybe_failover(shard, &replica_lags).await;
        }
    }

    /// Promote the lowest-lag live replica, unless the shard is cooling
    /// down from a recent failover.
    async fn maybe_failover(
        &self,
        shard: &Shard,
        replica_lags: &std::collections::HashMap<String, u64>,
    ) {
        if let Some(last) = self.cooldowns.get(&shard.id) {
            if last.elapsed() < self.config.failover_cooldown() {
                debug!(
                    "shard {} primary is down but failover is cooling down",
                    shard.id
                );
                return;
            }
        }

        let mut candidates: Vec<(&String, &u64)> = replica_lags.iter().collect();
        candidates.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        let Some((addr, lag)) = candidates.first() else {
            warn!(
                "shard {} primary is down and no live replica is available",
                shard.id
            );
            return;
        };
        let Some(replica) = shard.replica_by_addr(addr).cloned() else {
            return;
        };

        info!(
            "failing over shard {}: promoting {} (lag {} ms)",
            shard.id, addr, lag
        );
        let old_primary = shard.primary.addr();
        match self.manager.promote_replica(&shard.id, replica).await {
            Ok(_) => {
                self.cooldowns.insert(shard.id.clone(), Instant::now());
                self.failures.remove(&shard.id);
                self.registry.record_failover(FailoverEvent {
                    shard_id: shard.id.clone(),
                    old_primary,
                    new_primary: addr.to_string(),
                    reason: format!(
                        "primary down for {} consecutive probes",
                        self.config.failure_threshold
                    ),
                    at: Utc::now(),
                });
            }
            Err(ShardError::Conflict(msg)) => {
                // Someone else changed the shard under us; re-evaluate on
                // the next probe instead of overwriting.
                warn!("failover of {} lost a catalog race: {}", shard.id, msg);
            }
            Err(e) => {
                error!("failover of {} failed: {}", shard.id, e);
            }
        }
    }
}
