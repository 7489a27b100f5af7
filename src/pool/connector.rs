//! Database connectivity behind a capability interface
//!
//! The pool and router only see the `Connector`/`Connection` traits; tests
//! supply in-memory doubles and production uses the postgres implementation.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, ConnectOptions, Connection as _, Row, TypeInfo};

use crate::catalog::model::Endpoint;
use crate::error::{ShardError, ShardResult};

/// Result of one executed statement.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub rows: Vec<Value>,
    pub row_count: u64,
}

/// A live connection to one shard endpoint.
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, query: &str, params: &[Value]) -> ShardResult<QueryOutput>;

    /// Trivial liveness check.
    async fn ping(&mut self) -> ShardResult<()>;

    /// Replication delay as observed at this endpoint; zero on a primary.
    async fn replication_lag(&mut self) -> ShardResult<Duration>;
}

/// Opens connections to shard endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> ShardResult<Box<dyn Connection>>;
}

static READ_KEYWORDS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["select", "show", "explain", "with", "values", "table"]);

/// Leading-token read/write classification. Deliberately not a SQL parser:
/// the first keyword decides, which is sufficient for the read-only gate.
pub fn is_read_statement(query: &str) -> bool {
    match query.split_whitespace().next() {
        Some(first) => {
            let first = first.trim_start_matches('(').to_ascii_lowercase();
            READ_KEYWORDS.iter().any(|kw| *kw == first)
        }
        None => false,
    }
}

/// Production connector speaking the postgres wire protocol.
pub struct PgConnector {
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn ssl_mode(raw: &str) -> PgSslMode {
    match raw {
        "disable" => PgSslMode::Disable,
        "allow" => PgSslMode::Allow,
        "require" => PgSslMode::Require,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        _ => PgSslMode::Prefer,
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, endpoint: &Endpoint) -> ShardResult<Box<dyn Connection>> {
        let options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .database(&endpoint.database)
            .username(&endpoint.user)
            .password(&endpoint.password)
            .ssl_mode(ssl_mode(&endpoint.sslmode));

        let conn = tokio::time::timeout(self.connect_timeout, options.connect())
            .await
            .map_err(|_| {
                ShardError::Unreachable(format!("connect to {} timed out", endpoint.addr()))
            })?
            .map_err(|e| {
                ShardError::Unreachable(format!("connect to {}: {}", endpoint.addr(), e))
            })?;

        Ok(Box::new(PgShardConnection { conn }))
    }
}

struct PgShardConnection {
    conn: PgConnection,
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_param<'q>(query: PgQuery<'q>, param: &'q Value) -> PgQuery<'q> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        // Arrays and objects go over as jsonb
        other => query.bind(other),
    }
}

fn column_to_json(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map(|f| Value::from(f as f64)).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<sqlx::types::Uuid>, _>(index)
            .map(|v| v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map(|v| v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map(|v| v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        // Everything else is read as text; undecodable values become null
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = column_to_json(row, index, column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

#[async_trait]
impl Connection for PgShardConnection {
    async fn execute(&mut self, query: &str, params: &[Value]) -> ShardResult<QueryOutput> {
        let mut prepared = sqlx::query(query);
        for param in params {
            prepared = bind_param(prepared, param);
        }

        if is_read_statement(query) {
            let rows = prepared.fetch_all(&mut self.conn).await?;
            let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
            Ok(QueryOutput {
                row_count: rows.len() as u64,
                rows,
            })
        } else {
            let result = prepared.execute(&mut self.conn).await?;
            Ok(QueryOutput {
                rows: Vec::new(),
                row_count: result.rows_affected(),
            })
        }
    }

    async fn ping(&mut self) -> ShardResult<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| ShardError::Unreachable(e.to_string()))
    }

    async fn replication_lag(&mut self) -> ShardResult<Duration> {
        let seconds: Option<f64> = sqlx::query_scalar(
            "SELECT CASE WHEN pg_is_in_recovery() \
             THEN EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp())::float8 \
             ELSE 0.0 END",
        )
        .fetch_one(&mut self.conn)
        .await?;
        Ok(Duration::from_secs_f64(seconds.unwrap_or(0.0).max(0.0)))
    }
}
