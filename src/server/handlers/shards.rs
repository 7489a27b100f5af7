//! Control-plane endpoints for shard lifecycle

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::system::AppState;
use crate::catalog::model::{Shard, ShardStatus};
use crate::error::ShardError;
use crate::manager::{CreateShardRequest, EndpointOrDsn};

pub async fn create_shard(
    State(state): State<AppState>,
    Json(req): Json<CreateShardRequest>,
) -> Result<Json<Shard>, ShardError> {
    let shard = state.manager.create_shard(req).await?;
    Ok(Json(shard))
}

#[derive(Debug, Deserialize)]
pub struct ListShardsQuery {
    pub tenant_id: Option<String>,
}

pub async fn list_shards(
    State(state): State<AppState>,
    Query(query): Query<ListShardsQuery>,
) -> Result<Json<Value>, ShardError> {
    let shards = state.catalog.list_shards(query.tenant_id.as_deref());
    Ok(Json(json!({
        "count": shards.len(),
        "shards": shards,
    })))
}

pub async fn get_shard(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Shard>, ShardError> {
    Ok(Json(state.catalog.get_shard(&id)?))
}

pub async fn delete_shard(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ShardError> {
    state.manager.delete_shard(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ShardStatus,
}

pub async fn update_shard_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Shard>, ShardError> {
    let shard = state.manager.update_shard_status(&id, req.status).await?;
    Ok(Json(shard))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub replica_endpoint: EndpointOrDsn,
}

pub async fn promote_replica(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PromoteRequest>,
) -> Result<Json<Shard>, ShardError> {
    let replica = req.replica_endpoint.resolve()?;
    let shard = state.manager.promote_replica(&id, replica).await?;
    Ok(Json(shard))
}
