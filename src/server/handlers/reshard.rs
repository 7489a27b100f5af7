//! Control-plane endpoints for split/merge jobs

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::system::AppState;
use crate::catalog::model::{JobStatus, ReshardJob};
use crate::error::ShardError;
use crate::manager::{MergeRequest, SplitRequest};

pub async fn split(
    State(state): State<AppState>,
    Json(req): Json<SplitRequest>,
) -> Result<Json<ReshardJob>, ShardError> {
    let job = state.manager.split(req).await?;
    Ok(Json(job))
}

pub async fn merge(
    State(state): State<AppState>,
    Json(req): Json<MergeRequest>,
) -> Result<Json<ReshardJob>, ShardError> {
    let job = state.manager.merge(req).await?;
    Ok(Json(job))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReshardJob>, ShardError> {
    Ok(Json(state.manager.get_job(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Value>, ShardError> {
    let jobs = state.manager.list_jobs(query.status).await?;
    Ok(Json(json!({
        "count": jobs.len(),
        "jobs": jobs,
    })))
}
