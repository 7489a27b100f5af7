//! Shared fixtures for the integration tests
//!
//! Builds the whole stack on in-memory doubles: memory catalog store, a
//! scripted connector, and the in-memory data mover driving a real reshard
//! executor.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::util::ServiceExt;

use shardd::autoscale::{LoadMonitor, NoopCollector};
use shardd::catalog::model::Endpoint;
use shardd::catalog::{Catalog, MemoryCatalogStore};
use shardd::config::Config;
use shardd::error::{ShardError, ShardResult};
use shardd::health::HealthRegistry;
use shardd::manager::ShardManager;
use shardd::pool::{Connection, ConnectionPool, Connector, QueryOutput};
use shardd::reshard::{DataMover, MemoryDataMover, Resharder};
use shardd::router::Router as QueryRouter;
use shardd::server::{create_router, AppState};

/// Scripted connector: records which endpoints execute queries and can take
/// endpoints down, add replication lag, or slow queries down.
#[derive(Default)]
pub struct FakeConnector {
    pub hits: Mutex<Vec<String>>,
    pub down: Mutex<HashSet<String>>,
    pub lags: Mutex<HashMap<String, u64>>,
    pub hold_ms: AtomicU64,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, addr: &str) {
        self.down.lock().unwrap().insert(addr.to_string());
    }

    pub fn set_up(&self, addr: &str) {
        self.down.lock().unwrap().remove(addr);
    }

    pub fn set_lag(&self, addr: &str, ms: u64) {
        self.lags.lock().unwrap().insert(addr.to_string(), ms);
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    pub fn clear_hits(&self) {
        self.hits.lock().unwrap().clear();
    }
}

pub struct FakeConnection {
    addr: String,
    connector: Arc<FakeConnector>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&mut self, _query: &str, _params: &[Value]) -> ShardResult<QueryOutput> {
        let hold = self.connector.hold_ms.load(Ordering::Relaxed);
        if hold > 0 {
            tokio::time::sleep(Duration::from_millis(hold)).await;
        }
        if self.connector.down.lock().unwrap().contains(&self.addr) {
            return Err(ShardError::Unreachable(self.addr.clone()));
        }
        self.connector.hits.lock().unwrap().push(self.addr.clone());
        Ok(QueryOutput {
            rows: vec![json!({"ok": 1})],
            row_count: 1,
        })
    }

    async fn ping(&mut self) -> ShardResult<()> {
        if self.connector.down.lock().unwrap().contains(&self.addr) {
            return Err(ShardError::Unreachable(self.addr.clone()));
        }
        Ok(())
    }

    async fn replication_lag(&mut self) -> ShardResult<Duration> {
        let ms = self
            .connector
            .lags
            .lock()
            .unwrap()
            .get(&self.addr)
            .copied()
            .unwrap_or(0);
        Ok(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Connector for Arc<FakeConnector> {
    async fn connect(&self, endpoint: &Endpoint) -> ShardResult<Box<dyn Connection>> {
        let addr = endpoint.addr();
        if self.down.lock().unwrap().contains(&addr) {
            return Err(ShardError::Unreachable(addr));
        }
        Ok(Box::new(FakeConnection {
            addr,
            connector: self.clone(),
        }))
    }
}

pub struct TestApp {
    pub app: axum::Router,
    pub catalog: Arc<Catalog>,
    pub connector: Arc<FakeConnector>,
    pub mover: Arc<MemoryDataMover>,
    pub health: Arc<HealthRegistry>,
    pub router: Arc<QueryRouter>,
    pub manager: Arc<ShardManager>,
    pub pool: Arc<ConnectionPool>,
    pub config: Arc<Config>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub async fn build_app() -> TestApp {
    build_app_with(Config::default()).await
}

pub async fn build_app_with(config: Config) -> TestApp {
    let store = Arc::new(MemoryCatalogStore::new());
    let catalog = Arc::new(Catalog::open(store).await.expect("open catalog"));
    let connector = Arc::new(FakeConnector::new());
    let config = Arc::new(config);

    let pool = Arc::new(ConnectionPool::new(
        Arc::new(connector.clone()),
        config.max_connections,
        config.connection_ttl(),
    ));
    let health = Arc::new(HealthRegistry::new());
    let router = Arc::new(QueryRouter::new(
        catalog.clone(),
        pool.clone(),
        health.clone(),
        config.clone(),
    ));
    let manager = Arc::new(ShardManager::new(
        catalog.clone(),
        Arc::new(connector.clone()),
        config.clone(),
    ));

    let mover = Arc::new(MemoryDataMover::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resharder = Arc::new(Resharder::new(
        catalog.clone(),
        mover.clone() as Arc<dyn DataMover>,
        config.clone(),
        shutdown_rx,
    ));
    manager.set_resharder(resharder);

    let monitor = Arc::new(LoadMonitor::new(
        catalog.clone(),
        Arc::new(NoopCollector),
        config.clone(),
    ));

    let state = AppState {
        catalog: catalog.clone(),
        router: router.clone(),
        manager: manager.clone(),
        health: health.clone(),
        monitor,
        config: config.clone(),
        startup_time: Instant::now(),
    };

    TestApp {
        app: create_router(state),
        catalog,
        connector,
        mover,
        health,
        router,
        manager,
        pool,
        config,
        shutdown_tx,
    }
}

pub async fn post_json(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, json)
}

pub async fn patch_json(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, json)
}

pub async fn get(app: &axum::Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, json)
}

pub async fn delete(app: &axum::Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, json)
}

/// Register a tenant over the API and return its id.
pub async fn register_tenant(app: &axum::Router, name: &str, tier: &str) -> String {
    let (status, body) = post_json(
        app,
        "/client-apps",
        json!({ "name": name, "tier": tier }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "tenant registration failed: {}", body);
    body["id"].as_str().expect("tenant id").to_string()
}

/// Create a shard over the API and return its id.
pub async fn create_shard(app: &axum::Router, tenant_id: &str, name: &str, host: &str) -> String {
    let (status, body) = post_json(
        app,
        "/shards",
        json!({
            "name": name,
            "tenant_id": tenant_id,
            "endpoint": format!("postgres://app:pw@{}:5432/app", host),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "shard creation failed: {}", body);
    body["id"].as_str().expect("shard id").to_string()
}

/// Poll the catalog until the job reaches a terminal state.
pub async fn wait_for_job(catalog: &Catalog, job_id: &str, timeout: Duration) -> shardd::catalog::model::ReshardJob {
    let deadline = Instant::now() + timeout;
    loop {
        let job = catalog.get_job(job_id).await.expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {} still {} after {:?}",
            job_id,
            job.status,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
