//! HTTP route table

use axum::http::Method;
use axum::{
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::*;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        // Data plane
        .route("/execute", post(execute_query))
        .route("/shard-for-key", get(shard_for_key))
        .route("/health", get(health))
        // Control plane: shards
        .route("/shards", post(create_shard).get(list_shards))
        .route("/shards/{id}", get(get_shard).delete(delete_shard))
        .route("/shards/{id}/status", patch(update_shard_status))
        .route("/shards/{id}/promote", post(promote_replica))
        // Control plane: resharding
        .route("/reshard/split", post(split))
        .route("/reshard/merge", post(merge))
        .route("/reshard/jobs", get(list_jobs))
        .route("/reshard/jobs/{id}", get(get_job))
        // Tenants
        .route("/client-apps", post(create_app).get(list_apps))
        .route("/client-apps/{id}", get(get_app))
        // Operational views
        .route("/health/shards", get(shard_health))
        .route("/metrics/shards", get(shard_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
