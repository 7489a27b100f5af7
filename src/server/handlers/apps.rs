//! Tenant registration and quota lookup

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};

use super::system::AppState;
use crate::catalog::model::ClientApp;
use crate::error::ShardError;
use crate::manager::CreateAppRequest;

pub async fn create_app(
    State(state): State<AppState>,
    Json(req): Json<CreateAppRequest>,
) -> Result<Json<ClientApp>, ShardError> {
    let app = state.manager.create_app(req).await?;
    Ok(Json(app))
}

pub async fn list_apps(State(state): State<AppState>) -> Result<Json<Value>, ShardError> {
    let apps = state.catalog.list_apps();
    Ok(Json(json!({
        "count": apps.len(),
        "client_apps": apps,
    })))
}

pub async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ShardError> {
    let app = state.catalog.get_app(&id)?;
    let owned = state.catalog.list_shards(Some(&id));
    let cap = app.tier.max_shards();
    Ok(Json(json!({
        "client_app": app,
        "quota": {
            "max_shards": cap,
            "used": owned.len(),
            "remaining": if cap < 0 { Value::Null } else { json!((cap as i64 - owned.len() as i64).max(0)) },
        },
    })))
}
