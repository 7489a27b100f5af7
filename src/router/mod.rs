//! Data-plane request routing
//!
//! The router is stateless apart from caches: it resolves the owning shard
//! through the ring, gates on shard status, picks the primary or a healthy
//! replica, and executes over a pooled connection. Its catalog view is
//! monotonic: once a version is observed, no request is served from an
//! older one.

pub mod tenants;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::model::{CatalogSnapshot, Endpoint, Shard};
use crate::catalog::Catalog;
use crate::config::{Config, ReplicaPolicy};
use crate::error::{ShardError, ShardResult};
use crate::health::registry::HealthRegistry;
use crate::pool::{is_read_statement, ConnectionPool};
use crate::ring::HashRing;

pub use tenants::TenantTracker;

/// Read consistency requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Route to the primary.
    Strong,
    /// Replica reads allowed, bounded staleness.
    Eventual,
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::Strong
    }
}

/// Result of one routed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub shard_id: String,
    pub rows: Vec<Value>,
    pub row_count: u64,
    pub latency_ms: u64,
}

pub struct Router {
    catalog: Arc<Catalog>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthRegistry>,
    config: Arc<Config>,
    ring: RwLock<Arc<HashRing>>,
    /// Per-shard round-robin cursors for replica selection.
    rr_cursors: DashMap<String, AtomicUsize>,
    tenants: TenantTracker,
}

impl Router {
    pub fn new(
        catalog: Arc<Catalog>,
        pool: Arc<ConnectionPool>,
        health: Arc<HealthRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog,
            pool,
            health,
            config,
            ring: RwLock::new(Arc::new(HashRing::empty(-1))),
            rr_cursors: DashMap::new(),
            tenants: TenantTracker::new(),
        }
    }

    pub fn tenants(&self) -> &TenantTracker {
        &self.tenants
    }

    /// The ring for `snapshot`, rebuilt only when the catalog version moved.
    fn ring_for(&self, snapshot: &CatalogSnapshot) -> Arc<HashRing> {
        {
            let cached = self.ring.read();
            if cached.version() == snapshot.version {
                return cached.clone();
            }
        }

        let shards: Vec<(&str, &[u64])> = snapshot
            .routable_shards()
            .map(|s| (s.id.as_str(), s.vnodes.as_slice()))
            .collect();
        let fresh = Arc::new(HashRing::build(snapshot.version, shards));

        let mut cached = self.ring.write();
        // Never step the cached ring backwards
        if fresh.version() >= cached.version() {
            *cached = fresh.clone();
        }
        fresh
    }

    /// Resolve the shard owning `key`.
    pub fn shard_for(&self, key: &str) -> ShardResult<String> {
        let snapshot = self.catalog.snapshot();
        let ring = self.ring_for(&snapshot);
        ring.owner(key)
            .map(str::to_string)
            .ok_or_else(|| ShardError::NotRoutable(key.to_string()))
    }

    /// Pick the endpoint for this request: the primary under `strong`, a
    /// healthy replica under `eventual` (stable round-robin), falling back
    /// to the primary when no replica is usable.
    fn select_endpoint(&self, shard: &Shard, consistency: Consistency) -> Endpoint {
        if consistency == Consistency::Strong
            || self.config.replica_policy == ReplicaPolicy::PrimaryOnly
            || shard.replicas.is_empty()
        {
            return shard.primary.clone();
        }

        let healthy: Vec<&Endpoint> = shard
            .replicas
            .iter()
            .filter(|r| self.health.is_replica_healthy(&shard.id, &r.addr()))
            .collect();
        if healthy.is_empty() {
            debug!("no healthy replica for {}, falling back to primary", shard.id);
            return shard.primary.clone();
        }

        let cursor = self
            .rr_cursors
            .entry(shard.id.clone())
            .or_insert_with(|| AtomicUsize::new(0));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        healthy[index].clone()
    }

    /// Route and execute one parameterized query.
    pub async fn execute(
        &self,
        shard_key: &str,
        query: &str,
        params: &[Value],
        consistency: Consistency,
        deadline: Option<Duration>,
    ) -> ShardResult<QueryResponse> {
        let deadline = deadline.unwrap_or_else(|| self.config.request_timeout());
        match tokio::time::timeout(
            deadline,
            self.execute_inner(shard_key, query, params, consistency),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ShardError::Timeout(format!(
                "execute for key '{}' exceeded {:?}",
                shard_key, deadline
            ))),
        }
    }

    async fn execute_inner(
        &self,
        shard_key: &str,
        query: &str,
        params: &[Value],
        consistency: Consistency,
    ) -> ShardResult<QueryResponse> {
        let started = Instant::now();
        let snapshot = self.catalog.snapshot();
        let ring = self.ring_for(&snapshot);

        let shard_id = ring
            .owner(shard_key)
            .ok_or_else(|| ShardError::NotRoutable(shard_key.to_string()))?
            .to_string();
        let shard = snapshot
            .shards
            .get(&shard_id)
            .ok_or_else(|| {
                ShardError::InternalError(format!("ring owner '{}' missing from catalog", shard_id))
            })?;

        if !shard.status.is_routable() {
            return Err(ShardError::ShardUnavailable(shard_id));
        }
        let is_read = is_read_statement(query);
        if !is_read && !shard.status.accepts_writes() {
            return Err(ShardError::ReadOnly(shard_id));
        }

        let endpoint = self.select_endpoint(shard, consistency);
        let output = self.execute_on(&endpoint, query, params).await?;

        // Usage accounting: prefix-registered tenants win, otherwise the
        // shard's owner.
        let tenant_id = snapshot
            .app_by_prefix(shard_key)
            .map(|a| a.id.clone())
            .unwrap_or_else(|| shard.tenant_id.clone());
        self.tenants.record(&tenant_id, &shard_id);

        Ok(QueryResponse {
            shard_id,
            row_count: output.row_count,
            rows: output.rows,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Execute on an endpoint with one transparent retry on a fresh
    /// connection after a connection-level failure.
    async fn execute_on(
        &self,
        endpoint: &Endpoint,
        query: &str,
        params: &[Value],
    ) -> ShardResult<crate::pool::QueryOutput> {
        let mut retried = false;
        loop {
            let mut lease = self
                .pool
                .acquire(endpoint, self.config.acquire_timeout())
                .await?;
            match lease.connection().execute(query, params).await {
                Ok(output) => {
                    self.pool.release(lease);
                    return Ok(output);
                }
                Err(err @ ShardError::Unreachable(_)) if !retried => {
                    warn!(
                        "connection to {} failed mid-query, retrying once: {}",
                        endpoint.addr(),
                        err
                    );
                    self.pool.discard(lease);
                    retried = true;
                }
                Err(err) => {
                    // Errored leases are discarded, never parked
                    self.pool.discard(lease);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{ClientApp, QuotaTier, ShardStatus};
    use crate::catalog::{CatalogOp, MemoryCatalogStore};
    use crate::health::registry::{HealthStatus, ShardHealth};
    use crate::pool::{Connection, Connector, QueryOutput};
    use crate::ring::vnode_positions;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port: 5432,
            database: "app".into(),
            user: "app".into(),
            password: String::new(),
            sslmode: "prefer".into(),
        }
    }

    #[derive(Default)]
    struct RecordingConnector {
        /// Endpoint addrs that served an execute call.
        hits: Mutex<Vec<String>>,
        /// Addrs that refuse connections entirely.
        unreachable: Mutex<HashSet<String>>,
        /// Addrs whose first execute fails with a connection error.
        flaky: Mutex<HashSet<String>>,
        /// Artificial per-query latency in milliseconds.
        delay_ms: std::sync::atomic::AtomicU64,
    }

    struct RecordingConnection {
        addr: String,
        connector: Arc<RecordingConnector>,
        failed_once: bool,
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn execute(&mut self, _query: &str, _params: &[Value]) -> ShardResult<QueryOutput> {
            let delay = self.connector.delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let is_flaky = self.connector.flaky.lock().unwrap().contains(&self.addr);
            if is_flaky && !self.failed_once {
                self.failed_once = true;
                self.connector.flaky.lock().unwrap().remove(&self.addr);
                return Err(ShardError::Unreachable(self.addr.clone()));
            }
            self.connector.hits.lock().unwrap().push(self.addr.clone());
            Ok(QueryOutput {
                rows: vec![serde_json::json!({"ok": true})],
                row_count: 1,
            })
        }

        async fn ping(&mut self) -> ShardResult<()> {
            Ok(())
        }

        async fn replication_lag(&mut self) -> ShardResult<Duration> {
            Ok(Duration::ZERO)
        }
    }

    #[async_trait]
    impl Connector for Arc<RecordingConnector> {
        async fn connect(&self, endpoint: &Endpoint) -> ShardResult<Box<dyn Connection>> {
            let addr = endpoint.addr();
            if self.unreachable.lock().unwrap().contains(&addr) {
                return Err(ShardError::Unreachable(addr));
            }
            Ok(Box::new(RecordingConnection {
                addr,
                connector: self.clone(),
                failed_once: false,
            }))
        }
    }

    struct Fixture {
        router: Router,
        catalog: Arc<Catalog>,
        connector: Arc<RecordingConnector>,
        health: Arc<HealthRegistry>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryCatalogStore::new());
        let catalog = Arc::new(Catalog::open(store).await.unwrap());
        let connector = Arc::new(RecordingConnector::default());
        let config = Arc::new(Config::default());
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(connector.clone()),
            config.max_connections,
            config.connection_ttl(),
        ));
        let health = Arc::new(HealthRegistry::new());
        let router = Router::new(catalog.clone(), pool, health.clone(), config);
        Fixture {
            router,
            catalog,
            connector,
            health,
        }
    }

    async fn seed_shard(
        catalog: &Catalog,
        id: &str,
        primary_host: &str,
        replicas: &[&str],
        vnodes: u32,
        status: ShardStatus,
    ) {
        let mut shard = Shard::new(id.to_string(), "app-1".into(), endpoint(primary_host));
        shard.id = id.to_string();
        shard.replicas = replicas.iter().map(|h| endpoint(h)).collect();
        shard.status = status;
        shard.vnodes = vnode_positions(id, vnodes);
        catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_for_is_deterministic() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Active).await;
        seed_shard(&f.catalog, "shard-b", "db-b", &[], 4, ShardStatus::Active).await;

        let first = f.router.shard_for("user-42").unwrap();
        for _ in 0..1000 {
            assert_eq!(f.router.shard_for("user-42").unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_empty_catalog_is_not_routable() {
        let f = fixture().await;
        let err = f.router.shard_for("user-42").unwrap_err();
        assert!(matches!(err, ShardError::NotRoutable(_)));
    }

    #[tokio::test]
    async fn test_inactive_shards_leave_the_ring() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Inactive).await;
        let err = f.router.shard_for("user-42").unwrap_err();
        assert!(matches!(err, ShardError::NotRoutable(_)));
    }

    #[tokio::test]
    async fn test_strong_reads_hit_primary() {
        let f = fixture().await;
        seed_shard(
            &f.catalog,
            "shard-a",
            "db-primary",
            &["db-replica"],
            4,
            ShardStatus::Active,
        )
        .await;

        let response = f
            .router
            .execute("u1", "SELECT 1", &[], Consistency::Strong, None)
            .await
            .unwrap();
        assert_eq!(response.shard_id, "shard-a");
        assert_eq!(response.row_count, 1);

        let hits = f.connector.hits.lock().unwrap().clone();
        assert_eq!(hits, vec!["db-primary:5432/app"]);
    }

    #[tokio::test]
    async fn test_eventual_reads_round_robin_replicas() {
        let f = fixture().await;
        seed_shard(
            &f.catalog,
            "shard-a",
            "db-primary",
            &["db-r1", "db-r2"],
            4,
            ShardStatus::Active,
        )
        .await;

        for _ in 0..4 {
            f.router
                .execute("u1", "SELECT 1", &[], Consistency::Eventual, None)
                .await
                .unwrap();
        }

        let hits = f.connector.hits.lock().unwrap().clone();
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|a| a != "db-primary:5432/app"));
        // Stable alternation over both replicas
        assert!(hits.contains(&"db-r1:5432/app".to_string()));
        assert!(hits.contains(&"db-r2:5432/app".to_string()));
    }

    #[tokio::test]
    async fn test_eventual_falls_back_to_primary_when_replicas_down() {
        let f = fixture().await;
        seed_shard(
            &f.catalog,
            "shard-a",
            "db-primary",
            &["db-r1"],
            4,
            ShardStatus::Active,
        )
        .await;

        f.health.record(ShardHealth {
            shard_id: "shard-a".into(),
            primary_up: true,
            replicas_up: vec![],
            replicas_down: vec!["db-r1:5432/app".into()],
            replica_lags: HashMap::new(),
            replication_lag_ms: 0,
            last_check: chrono::Utc::now(),
            status: HealthStatus::Degraded,
        });

        f.router
            .execute("u1", "SELECT 1", &[], Consistency::Eventual, None)
            .await
            .unwrap();
        let hits = f.connector.hits.lock().unwrap().clone();
        assert_eq!(hits, vec!["db-primary:5432/app"]);
    }

    #[tokio::test]
    async fn test_strong_never_falls_back_to_replica() {
        let f = fixture().await;
        seed_shard(
            &f.catalog,
            "shard-a",
            "db-primary",
            &["db-r1"],
            4,
            ShardStatus::Active,
        )
        .await;
        f.connector
            .unreachable
            .lock()
            .unwrap()
            .insert("db-primary:5432/app".into());

        let err = f
            .router
            .execute("u1", "SELECT 1", &[], Consistency::Strong, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Unreachable(_)));
        assert!(f.connector.hits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_to_readonly_shard_fail() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Readonly).await;

        let err = f
            .router
            .execute(
                "u1",
                "INSERT INTO records VALUES ($1)",
                &[serde_json::json!("x")],
                Consistency::Strong,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::ReadOnly(_)));

        // Reads still pass
        f.router
            .execute("u1", "SELECT 1", &[], Consistency::Strong, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_migrating_shard_accepts_writes() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Migrating).await;

        f.router
            .execute(
                "u1",
                "UPDATE records SET v = $1",
                &[serde_json::json!(1)],
                Consistency::Strong,
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transparent_retry_on_connection_failure() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Active).await;
        f.connector
            .flaky
            .lock()
            .unwrap()
            .insert("db-a:5432/app".into());

        // First execute dies mid-flight; the retry on a fresh connection
        // must succeed transparently.
        let response = f
            .router
            .execute("u1", "SELECT 1", &[], Consistency::Strong, None)
            .await
            .unwrap();
        assert_eq!(response.row_count, 1);
        assert_eq!(f.connector.hits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ring_follows_catalog_version() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Active).await;
        let owner_before = f.router.shard_for("user-42").unwrap();
        assert_eq!(owner_before, "shard-a");

        // Take shard-a off the ring; routing must follow the new version
        let mut shard = f.catalog.get_shard("shard-a").unwrap();
        shard.status = ShardStatus::Inactive;
        shard.touch();
        f.catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap();

        assert!(f.router.shard_for("user-42").is_err());
    }

    #[tokio::test]
    async fn test_tenant_usage_recorded_with_prefix_attribution() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Active).await;
        let mut app = ClientApp::new("orders".into(), QuotaTier::Free, Some("ord-".into()));
        app.id = "app-orders".into();
        f.catalog.commit(vec![CatalogOp::PutApp(app)]).await.unwrap();

        f.router
            .execute("ord-77", "SELECT 1", &[], Consistency::Strong, None)
            .await
            .unwrap();
        f.router
            .execute("usr-77", "SELECT 1", &[], Consistency::Strong, None)
            .await
            .unwrap();

        // Prefixed key attributes to the registered app, the other to the
        // shard's owning tenant.
        assert_eq!(f.router.tenants().request_count("app-orders"), 1);
        assert_eq!(f.router.tenants().request_count("app-1"), 1);
    }

    #[tokio::test]
    async fn test_deadline_surfaces_timeout() {
        let f = fixture().await;
        seed_shard(&f.catalog, "shard-a", "db-a", &[], 4, ShardStatus::Active).await;
        f.connector.delay_ms.store(200, Ordering::Relaxed);

        let err = f
            .router
            .execute(
                "u1",
                "SELECT 1",
                &[],
                Consistency::Strong,
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Timeout(_)));
    }
}
