//! Data-plane endpoints: query execution and key resolution

use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::system::AppState;
use crate::error::ShardError;
use crate::router::Consistency;

#[derive(Debug, Deserialize)]
pub struct ExecuteOptions {
    /// Per-request deadline override in milliseconds.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub shard_key: String,
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub consistency: Consistency,
    #[serde(default)]
    pub options: Option<ExecuteOptions>,
}

pub async fn execute_query(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<crate::router::QueryResponse>, ShardError> {
    if req.shard_key.is_empty() {
        return Err(ShardError::Validation("shard_key is required".into()));
    }
    if req.query.trim().is_empty() {
        return Err(ShardError::Validation("query is required".into()));
    }

    let deadline = req
        .options
        .as_ref()
        .and_then(|o| o.timeout_ms)
        .map(Duration::from_millis);

    let response = state
        .router
        .execute(
            &req.shard_key,
            &req.query,
            &req.params,
            req.consistency,
            deadline,
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

pub async fn shard_for_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<Value>, ShardError> {
    let shard_id = state.router.shard_for(&query.key)?;
    Ok(Json(json!({ "shard_id": shard_id })))
}
