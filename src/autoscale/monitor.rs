//! Per-shard load sampling
//!
//! Collectors are pluggable: the default returns zeros and exists as the
//! extension point, the system collector reports host-level CPU and memory
//! through sysinfo. Samples land in a shared map read by the detector and
//! the HTTP surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::catalog::model::Shard;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::ShardResult;

/// One sample of a shard's load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardMetrics {
    /// Queries per second.
    pub query_rate: f64,
    pub connection_count: f64,
    /// Percentages in [0, 100].
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub storage_usage: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
}

#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self, shard: &Shard) -> ShardResult<ShardMetrics>;
}

/// Default collector: all zeros. Deployments wire a real one.
pub struct NoopCollector;

#[async_trait]
impl MetricsCollector for NoopCollector {
    async fn collect(&self, _shard: &Shard) -> ShardResult<ShardMetrics> {
        Ok(ShardMetrics::default())
    }
}

/// Host-level collector: reports this host's CPU and memory for every
/// shard. Useful when shards are colocated with the router.
pub struct SystemCollector {
    system: Mutex<System>,
}

impl SystemCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
        }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsCollector for SystemCollector {
    async fn collect(&self, _shard: &Shard) -> ShardResult<ShardMetrics> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_usage = system.global_cpu_info().cpu_usage() as f64;
        let memory_usage = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        Ok(ShardMetrics {
            cpu_usage,
            memory_usage,
            ..ShardMetrics::default()
        })
    }
}

pub struct LoadMonitor {
    catalog: Arc<Catalog>,
    collector: Arc<dyn MetricsCollector>,
    config: Arc<Config>,
    samples: RwLock<HashMap<String, ShardMetrics>>,
}

impl LoadMonitor {
    pub fn new(
        catalog: Arc<Catalog>,
        collector: Arc<dyn MetricsCollector>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog,
            collector,
            config,
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("load monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Sample every routable shard once.
    pub async fn sample_all(&self) {
        let snapshot = self.catalog.snapshot();
        let mut fresh = HashMap::new();
        for shard in snapshot.shards.values() {
            if !shard.status.is_routable() {
                continue;
            }
            match self.collector.collect(shard).await {
                Ok(metrics) => {
                    fresh.insert(shard.id.clone(), metrics);
                }
                Err(e) => {
                    warn!("metrics collection for {} failed: {}", shard.id, e);
                }
            }
        }
        *self.samples.write() = fresh;
    }

    pub fn latest(&self) -> HashMap<String, ShardMetrics> {
        self.samples.read().clone()
    }

    pub fn get(&self, shard_id: &str) -> Option<ShardMetrics> {
        self.samples.read().get(shard_id).cloned()
    }
}
