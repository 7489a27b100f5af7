//! Data movement behind a capability interface
//!
//! The reshard executor drives migrations through `DataMover`; production
//! uses the SQL implementation against the configured data table, tests and
//! embedded setups use the in-memory mover.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::catalog::model::Endpoint;
use crate::config::ReshardConfig;
use crate::error::{ShardError, ShardResult};
use crate::pool::ConnectionPool;

/// One row in flight between shards.
#[derive(Debug, Clone)]
pub struct MovedRow {
    pub key: String,
    pub data: Value,
}

/// Count plus an order-insensitive checksum over a set of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeDigest {
    pub count: u64,
    pub checksum: i64,
}

#[async_trait]
pub trait DataMover: Send + Sync {
    /// Rows on `source` with keys strictly after `cursor`, in key order.
    async fn scan_batch(
        &self,
        source: &Endpoint,
        cursor: Option<&str>,
        limit: usize,
    ) -> ShardResult<Vec<MovedRow>>;

    /// Rows whose change watermark advanced past `since`.
    async fn scan_changed_since(
        &self,
        source: &Endpoint,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ShardResult<Vec<MovedRow>>;

    /// Idempotently write rows to `target`.
    async fn upsert_batch(&self, target: &Endpoint, rows: &[MovedRow]) -> ShardResult<()>;

    async fn count_keys(&self, endpoint: &Endpoint) -> ShardResult<u64>;

    /// Digest of the listed keys as stored on `endpoint`.
    async fn checksum_keys(&self, endpoint: &Endpoint, keys: &[String]) -> ShardResult<RangeDigest>;
}

/// Moves rows through SQL over pooled connections. Assumes the conventional
/// layout from `ReshardConfig`: one data table with a text shard-key column
/// and a timestamp change column.
pub struct SqlDataMover {
    pool: Arc<ConnectionPool>,
    config: ReshardConfig,
    acquire_timeout: Duration,
}

impl SqlDataMover {
    pub fn new(pool: Arc<ConnectionPool>, config: ReshardConfig, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            config,
            acquire_timeout,
        }
    }

    async fn run(
        &self,
        endpoint: &Endpoint,
        query: &str,
        params: &[Value],
    ) -> ShardResult<Vec<Value>> {
        let mut lease = self.pool.acquire(endpoint, self.acquire_timeout).await?;
        match lease.connection().execute(query, params).await {
            Ok(output) => {
                self.pool.release(lease);
                Ok(output.rows)
            }
            Err(e) => {
                self.pool.discard(lease);
                Err(e)
            }
        }
    }

    fn rows_from(&self, raw: Vec<Value>) -> Vec<MovedRow> {
        raw.into_iter()
            .filter_map(|row| {
                let key = row.get("mk")?.as_str()?.to_string();
                let data = row.get("mrow").cloned().unwrap_or(Value::Null);
                Some(MovedRow { key, data })
            })
            .collect()
    }
}

#[async_trait]
impl DataMover for SqlDataMover {
    async fn scan_batch(
        &self,
        source: &Endpoint,
        cursor: Option<&str>,
        limit: usize,
    ) -> ShardResult<Vec<MovedRow>> {
        let query = format!(
            "SELECT {key} AS mk, row_to_json(t) AS mrow FROM {table} t \
             WHERE {key} > $1 ORDER BY {key} LIMIT {limit}",
            key = self.config.key_column,
            table = self.config.data_table,
            limit = limit,
        );
        let raw = self
            .run(source, &query, &[Value::String(cursor.unwrap_or("").to_string())])
            .await?;
        Ok(self.rows_from(raw))
    }

    async fn scan_changed_since(
        &self,
        source: &Endpoint,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ShardResult<Vec<MovedRow>> {
        let query = format!(
            "SELECT {key} AS mk, row_to_json(t) AS mrow FROM {table} t \
             WHERE {change} > $1::timestamptz ORDER BY {change} LIMIT {limit}",
            key = self.config.key_column,
            table = self.config.data_table,
            change = self.config.change_column,
            limit = limit,
        );
        let raw = self
            .run(source, &query, &[Value::String(since.to_rfc3339())])
            .await?;
        Ok(self.rows_from(raw))
    }

    async fn upsert_batch(&self, target: &Endpoint, rows: &[MovedRow]) -> ShardResult<()> {
        let delete = format!(
            "DELETE FROM {table} WHERE {key} = $1",
            table = self.config.data_table,
            key = self.config.key_column,
        );
        let insert = format!(
            "INSERT INTO {table} SELECT * FROM json_populate_record(NULL::{table}, $1::json)",
            table = self.config.data_table,
        );
        for row in rows {
            self.run(target, &delete, &[Value::String(row.key.clone())])
                .await?;
            self.run(target, &insert, &[row.data.clone()]).await?;
        }
        Ok(())
    }

    async fn count_keys(&self, endpoint: &Endpoint) -> ShardResult<u64> {
        let query = format!(
            "SELECT count(*)::int8 AS n FROM {table}",
            table = self.config.data_table
        );
        let rows = self.run(endpoint, &query, &[]).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(|n| n.as_i64())
            .unwrap_or(0) as u64)
    }

    async fn checksum_keys(&self, endpoint: &Endpoint, keys: &[String]) -> ShardResult<RangeDigest> {
        let mut count = 0u64;
        let mut checksum = 0i64;
        // Chunk the key list so parameter payloads stay bounded
        for chunk in keys.chunks(self.config.batch_size.max(1)) {
            let query = format!(
                "SELECT count(*)::int8 AS n, \
                 COALESCE(sum(hashtext({key} || t::text)::int8), 0)::int8 AS c \
                 FROM {table} t WHERE {key} IN \
                 (SELECT jsonb_array_elements_text($1::jsonb))",
                key = self.config.key_column,
                table = self.config.data_table,
            );
            let keys_json = Value::Array(chunk.iter().map(|k| Value::String(k.clone())).collect());
            let rows = self.run(endpoint, &query, &[keys_json]).await?;
            if let Some(row) = rows.first() {
                count += row.get("n").and_then(|n| n.as_i64()).unwrap_or(0) as u64;
                checksum =
                    checksum.wrapping_add(row.get("c").and_then(|c| c.as_i64()).unwrap_or(0));
            }
        }
        Ok(RangeDigest { count, checksum })
    }
}

#[derive(Clone)]
struct StoredRow {
    data: Value,
    updated_at: DateTime<Utc>,
}

/// In-memory mover keyed by endpoint addr. Backs tests and embedded setups;
/// rows are inserted directly via `seed_row`.
#[derive(Default)]
pub struct MemoryDataMover {
    tables: RwLock<std::collections::HashMap<String, BTreeMap<String, StoredRow>>>,
}

impl MemoryDataMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_row(&self, endpoint: &Endpoint, key: &str, data: Value) {
        self.tables
            .write()
            .entry(endpoint.addr())
            .or_default()
            .insert(
                key.to_string(),
                StoredRow {
                    data,
                    updated_at: Utc::now(),
                },
            );
    }

    pub fn row_count(&self, endpoint: &Endpoint) -> usize {
        self.tables
            .read()
            .get(&endpoint.addr())
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn keys(&self, endpoint: &Endpoint) -> Vec<String> {
        self.tables
            .read()
            .get(&endpoint.addr())
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn digest_row(key: &str, data: &Value) -> i64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        data.to_string().hash(&mut hasher);
        hasher.finish() as i64
    }
}

#[async_trait]
impl DataMover for MemoryDataMover {
    async fn scan_batch(
        &self,
        source: &Endpoint,
        cursor: Option<&str>,
        limit: usize,
    ) -> ShardResult<Vec<MovedRow>> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&source.addr()) else {
            return Ok(Vec::new());
        };
        let start = cursor.unwrap_or("").to_string();
        Ok(table
            .range(start.clone()..)
            .filter(|(k, _)| **k > start)
            .take(limit)
            .map(|(k, row)| MovedRow {
                key: k.clone(),
                data: row.data.clone(),
            })
            .collect())
    }

    async fn scan_changed_since(
        &self,
        source: &Endpoint,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ShardResult<Vec<MovedRow>> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&source.addr()) else {
            return Ok(Vec::new());
        };
        Ok(table
            .iter()
            .filter(|(_, row)| row.updated_at > since)
            .take(limit)
            .map(|(k, row)| MovedRow {
                key: k.clone(),
                data: row.data.clone(),
            })
            .collect())
    }

    async fn upsert_batch(&self, target: &Endpoint, rows: &[MovedRow]) -> ShardResult<()> {
        let mut tables = self.tables.write();
        let table = tables.entry(target.addr()).or_default();
        for row in rows {
            table.insert(
                row.key.clone(),
                StoredRow {
                    data: row.data.clone(),
                    updated_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn count_keys(&self, endpoint: &Endpoint) -> ShardResult<u64> {
        Ok(self.row_count(endpoint) as u64)
    }

    async fn checksum_keys(&self, endpoint: &Endpoint, keys: &[String]) -> ShardResult<RangeDigest> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&endpoint.addr()) else {
            return Ok(RangeDigest {
                count: 0,
                checksum: 0,
            });
        };
        let mut count = 0u64;
        let mut checksum = 0i64;
        for key in keys {
            if let Some(row) = table.get(key) {
                count += 1;
                checksum = checksum.wrapping_add(Self::digest_row(key, &row.data));
            }
        }
        Ok(RangeDigest { count, checksum })
    }
}
