use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No shard owns key '{0}'")]
    NotRoutable(String),

    #[error("Shard '{0}' is unavailable")]
    ShardUnavailable(String),

    #[error("Shard '{0}' is read-only")]
    ReadOnly(String),

    #[error("Catalog version conflict: {0}")]
    Conflict(String),

    #[error("Connection pool exhausted for endpoint '{0}'")]
    PoolExhausted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type ShardResult<T> = Result<T, ShardError>;

impl ShardError {
    /// Stable machine-readable code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ShardError::Validation(_) => "validation",
            ShardError::NotFound(_) => "not_found",
            ShardError::NotRoutable(_) => "not_routable",
            ShardError::ShardUnavailable(_) => "shard_unavailable",
            ShardError::ReadOnly(_) => "read_only",
            ShardError::Conflict(_) => "conflict",
            ShardError::PoolExhausted(_) => "pool_exhausted",
            ShardError::Timeout(_) => "timeout",
            ShardError::Canceled(_) => "canceled",
            ShardError::Unreachable(_) => "unreachable",
            ShardError::Unauthorized(_) => "unauthorized",
            ShardError::QueryFailed(_) => "query_failed",
            ShardError::Invariant(_) => "invariant",
            ShardError::IoError(_) => "io",
            ShardError::JsonError(_) => "json",
            ShardError::InternalError(_) => "internal",
        }
    }

    /// Whether a client may retry the same request and expect it to succeed.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ShardError::Conflict(_)
                | ShardError::Timeout(_)
                | ShardError::PoolExhausted(_)
                | ShardError::Unreachable(_)
        )
    }
}

impl serde::Serialize for ShardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for ShardError {
    fn from(err: rocksdb::Error) -> Self {
        ShardError::InternalError(err.into_string())
    }
}

impl From<sqlx::Error> for ShardError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => ShardError::Timeout("database pool timed out".into()),
            sqlx::Error::Io(e) => ShardError::Unreachable(e.to_string()),
            sqlx::Error::Tls(e) => ShardError::Unreachable(e.to_string()),
            sqlx::Error::Database(e) => ShardError::QueryFailed(e.to_string()),
            other => ShardError::QueryFailed(other.to_string()),
        }
    }
}

impl IntoResponse for ShardError {
    fn into_response(self) -> Response {
        let status = match &self {
            ShardError::Validation(_) => StatusCode::BAD_REQUEST,
            ShardError::NotFound(_) | ShardError::NotRoutable(_) => StatusCode::NOT_FOUND,
            ShardError::ShardUnavailable(_) | ShardError::PoolExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ShardError::ReadOnly(_) | ShardError::Conflict(_) => StatusCode::CONFLICT,
            ShardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ShardError::Canceled(_) => StatusCode::REQUEST_TIMEOUT,
            ShardError::Unreachable(_) => StatusCode::BAD_GATEWAY,
            ShardError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "retriable": self.retriable(),
        });

        (status, Json(body)).into_response()
    }
}
