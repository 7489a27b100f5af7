//! Shared handler state and the liveness/observability endpoints

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::autoscale::{HotShardDetector, LoadMonitor};
use crate::catalog::model::ShardStatus;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::ShardError;
use crate::health::HealthRegistry;
use crate::manager::ShardManager;
use crate::router::Router as QueryRouter;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub router: Arc<QueryRouter>,
    pub manager: Arc<ShardManager>,
    pub health: Arc<HealthRegistry>,
    pub monitor: Arc<LoadMonitor>,
    pub config: Arc<Config>,
    pub startup_time: Instant,
}

/// Liveness object: uptime, catalog version, shard counts, health summary.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.catalog.snapshot();
    let mut by_status = std::collections::HashMap::new();
    for shard in snapshot.shards.values() {
        *by_status.entry(shard.status.to_string()).or_insert(0u32) += 1;
    }
    let active = by_status
        .get(&ShardStatus::Active.to_string())
        .copied()
        .unwrap_or(0);

    Json(json!({
        "status": "up",
        "uptime_secs": state.startup_time.elapsed().as_secs(),
        "catalog_version": snapshot.version,
        "catalog_stale": snapshot.stale,
        "shards": {
            "total": snapshot.shards.len(),
            "active": active,
            "by_status": by_status,
        },
        "tenants": snapshot.apps.len(),
    }))
}

/// Health registry dump plus failover history.
pub async fn shard_health(State(state): State<AppState>) -> Result<Json<Value>, ShardError> {
    Ok(Json(json!({
        "shards": state.health.all(),
        "failovers": state.health.failover_history(),
    })))
}

/// Latest load samples with their hot/cold classification.
pub async fn shard_metrics(State(state): State<AppState>) -> Result<Json<Value>, ShardError> {
    let detector = HotShardDetector::new(state.config.autoscale.clone());
    let samples = state.monitor.latest();
    let mut ids: Vec<&String> = samples.keys().collect();
    ids.sort();

    let mut shards = Vec::with_capacity(samples.len());
    for id in ids {
        let metrics = &samples[id];
        shards.push(json!({
            "shard_id": id,
            "metrics": metrics,
            "class": detector.classify(metrics),
        }));
    }
    Ok(Json(json!({ "shards": shards })))
}
