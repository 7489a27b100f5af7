//! Pluggable key-value backends for the catalog
//!
//! The catalog persists JSON-encoded entities under prefixed keys:
//! `/shards/<id>`, `/client_apps/<id>`, `/jobs/<id>`. Every committed
//! mutation CASes `/catalog/version`, which makes the version counter the
//! single linearization point for all catalog writes.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ShardError, ShardResult};

pub const SHARD_PREFIX: &str = "/shards/";
pub const APP_PREFIX: &str = "/client_apps/";
pub const JOB_PREFIX: &str = "/jobs/";
pub const VERSION_KEY: &str = "/catalog/version";

pub fn shard_key(id: &str) -> String {
    format!("{}{}", SHARD_PREFIX, id)
}

pub fn app_key(id: &str) -> String {
    format!("{}{}", APP_PREFIX, id)
}

pub fn job_key(id: &str) -> String {
    format!("{}{}", JOB_PREFIX, id)
}

/// One write inside a committed batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Durable backend for the catalog.
///
/// Implementations must make `commit` atomic: either the version CAS and all
/// ops apply, or nothing does. A lost CAS surfaces as `Conflict` and the
/// caller re-reads and retries.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, key: &str) -> ShardResult<Option<Vec<u8>>>;

    /// All key/value pairs whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> ShardResult<Vec<(String, Vec<u8>)>>;

    async fn current_version(&self) -> ShardResult<i64>;

    /// Apply `ops` and advance `/catalog/version` from `expected_version` to
    /// `new_version` atomically.
    async fn commit(
        &self,
        expected_version: i64,
        new_version: i64,
        ops: Vec<WriteOp>,
    ) -> ShardResult<()>;
}

pub(crate) fn decode_version(raw: Option<Vec<u8>>) -> ShardResult<i64> {
    match raw {
        None => Ok(0),
        Some(bytes) => {
            let s = std::str::from_utf8(&bytes)
                .map_err(|_| ShardError::InternalError("catalog version is not UTF-8".into()))?;
            s.trim()
                .parse::<i64>()
                .map_err(|_| ShardError::InternalError(format!("bad catalog version '{}'", s)))
        }
    }
}

/// In-memory store used by tests and single-process setups.
#[derive(Default)]
pub struct MemoryCatalogStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Simulates a backend outage; reads and writes fail while set.
    unavailable: AtomicBool,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the simulated outage on or off.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> ShardResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ShardError::Unreachable("catalog store is down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn get(&self, key: &str) -> ShardResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &str) -> ShardResult<Vec<(String, Vec<u8>)>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn current_version(&self) -> ShardResult<i64> {
        self.check_available()?;
        decode_version(self.data.read().get(VERSION_KEY).cloned())
    }

    async fn commit(
        &self,
        expected_version: i64,
        new_version: i64,
        ops: Vec<WriteOp>,
    ) -> ShardResult<()> {
        self.check_available()?;
        let mut data = self.data.write();
        let current = decode_version(data.get(VERSION_KEY).cloned())?;
        if current != expected_version {
            return Err(ShardError::Conflict(format!(
                "catalog version is {}, commit expected {}",
                current, expected_version
            )));
        }
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        data.insert(VERSION_KEY.to_string(), new_version.to_string().into_bytes());
        Ok(())
    }
}
