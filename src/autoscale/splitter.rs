//! Cooldown-gated automatic splitting of hot shards

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::detector::{HotShardDetector, LoadClass};
use super::monitor::LoadMonitor;
use crate::catalog::model::ShardStatus;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::ShardError;
use crate::manager::{ShardManager, SplitRequest};

pub struct AutoSplitter {
    catalog: Arc<Catalog>,
    monitor: Arc<LoadMonitor>,
    detector: HotShardDetector,
    manager: Arc<ShardManager>,
    config: Arc<Config>,
    /// Last automatic split per shard, for the cooldown gate.
    last_split: DashMap<String, Instant>,
}

impl AutoSplitter {
    pub fn new(
        catalog: Arc<Catalog>,
        monitor: Arc<LoadMonitor>,
        manager: Arc<ShardManager>,
        config: Arc<Config>,
    ) -> Self {
        let detector = HotShardDetector::new(config.autoscale.clone());
        Self {
            catalog,
            monitor,
            detector,
            manager,
            config,
            last_split: DashMap::new(),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.decision_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.decide_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("auto-splitter stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One decision pass: submit a two-way split for every hot shard that is
    /// active, outside its cooldown, and not already resharding.
    pub async fn decide_once(&self) {
        for (shard_id, metrics) in self.monitor.latest() {
            if self.detector.classify(&metrics) != LoadClass::Hot {
                continue;
            }

            if let Some(last) = self.last_split.get(&shard_id) {
                if last.elapsed() < self.config.split_cooldown() {
                    debug!("shard {} is hot but cooling down from a split", shard_id);
                    continue;
                }
            }

            let Ok(shard) = self.catalog.get_shard(&shard_id) else {
                continue;
            };
            if shard.status != ShardStatus::Active {
                continue;
            }
            match self.catalog.active_job_for(&shard_id).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    debug!("shard {} is hot but already resharding", shard_id);
                    continue;
                }
                Err(e) => {
                    warn!("could not check jobs for {}: {}", shard_id, e);
                    continue;
                }
            }

            info!(
                "shard {} is hot (qps {:.0}, cpu {:.0}%), submitting split",
                shard_id, metrics.query_rate, metrics.cpu_usage
            );
            match self
                .manager
                .split(SplitRequest {
                    shard_id: shard_id.clone(),
                    targets: vec![],
                })
                .await
            {
                Ok(job) => {
                    self.last_split.insert(shard_id.clone(), Instant::now());
                    info!("automatic split of {} running as job {}", shard_id, job.id);
                }
                Err(ShardError::Validation(msg)) => {
                    debug!("automatic split of {} skipped: {}", shard_id, msg);
                }
                Err(e) => {
                    warn!("automatic split of {} failed: {}", shard_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscale::monitor::{MetricsCollector, ShardMetrics};
    use crate::catalog::model::{Endpoint, Shard};
    use crate::catalog::{CatalogOp, MemoryCatalogStore};
    use crate::pool::{Connection, Connector, QueryOutput};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct OkConnection;

    #[async_trait]
    impl Connection for OkConnection {
        async fn execute(&mut self, _q: &str, _p: &[Value]) -> crate::error::ShardResult<QueryOutput> {
            Ok(QueryOutput::default())
        }
        async fn ping(&mut self) -> crate::error::ShardResult<()> {
            Ok(())
        }
        async fn replication_lag(&mut self) -> crate::error::ShardResult<Duration> {
            Ok(Duration::ZERO)
        }
    }

    struct OkConnector;

    #[async_trait]
    impl Connector for OkConnector {
        async fn connect(&self, _e: &Endpoint) -> crate::error::ShardResult<Box<dyn Connection>> {
            Ok(Box::new(OkConnection))
        }
    }

    struct HotCollector;

    #[async_trait]
    impl MetricsCollector for HotCollector {
        async fn collect(&self, _shard: &Shard) -> crate::error::ShardResult<ShardMetrics> {
            Ok(ShardMetrics {
                query_rate: 50_000.0,
                cpu_usage: 95.0,
                ..ShardMetrics::default()
            })
        }
    }

    struct Fixture {
        splitter: AutoSplitter,
        monitor: Arc<LoadMonitor>,
        catalog: Arc<Catalog>,
    }

    async fn fixture(collector: Arc<dyn MetricsCollector>) -> Fixture {
        let store = Arc::new(MemoryCatalogStore::new());
        let catalog = Arc::new(Catalog::open(store).await.unwrap());
        let config = Arc::new(Config::default());
        let monitor = Arc::new(LoadMonitor::new(catalog.clone(), collector, config.clone()));
        let manager = Arc::new(ShardManager::new(
            catalog.clone(),
            Arc::new(OkConnector),
            config.clone(),
        ));
        let splitter = AutoSplitter::new(catalog.clone(), monitor.clone(), manager, config);
        Fixture {
            splitter,
            monitor,
            catalog,
        }
    }

    async fn seed_shard(catalog: &Catalog, id: &str) {
        let mut shard = Shard::new(
            id.into(),
            "app-1".into(),
            Endpoint {
                host: "db1".into(),
                port: 5432,
                database: "app".into(),
                user: "app".into(),
                password: String::new(),
                sslmode: "prefer".into(),
            },
        );
        shard.id = id.into();
        shard.vnodes = crate::ring::vnode_positions(id, 4);
        catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_hot_shard_gets_split_once() {
        let f = fixture(Arc::new(HotCollector)).await;
        seed_shard(&f.catalog, "shard-a").await;
        f.monitor.sample_all().await;

        f.splitter.decide_once().await;
        let jobs = f.catalog.list_jobs(None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_shards, vec!["shard-a"]);

        // Still hot, but now migrating and in cooldown: no second job
        f.monitor.sample_all().await;
        f.splitter.decide_once().await;
        assert_eq!(f.catalog.list_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cold_shard_is_left_alone() {
        let f = fixture(Arc::new(crate::autoscale::monitor::NoopCollector)).await;
        seed_shard(&f.catalog, "shard-a").await;
        f.monitor.sample_all().await;

        f.splitter.decide_once().await;
        assert!(f.catalog.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_blocks_resubmission() {
        let f = fixture(Arc::new(HotCollector)).await;
        seed_shard(&f.catalog, "shard-a").await;
        f.monitor.sample_all().await;

        // Simulate a very recent automatic split
        f.splitter
            .last_split
            .insert("shard-a".to_string(), Instant::now());
        f.splitter.decide_once().await;
        assert!(f.catalog.list_jobs(None).await.unwrap().is_empty());
    }
}
