//! RocksDB-backed catalog store

use async_trait::async_trait;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Mutex;

use super::store::{decode_version, CatalogStore, WriteOp, VERSION_KEY};
use crate::error::{ShardError, ShardResult};

/// Durable catalog store on a local RocksDB instance.
///
/// RocksDB gives atomic batch writes; the commit mutex serializes the
/// read-check-write of the version CAS so concurrent committers in this
/// process cannot interleave between the version read and the batch write.
pub struct RocksCatalogStore {
    db: DB,
    commit_lock: Mutex<()>,
}

impl RocksCatalogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> ShardResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        // The catalog is small; keep RocksDB logs from accumulating
        opts.set_keep_log_file_num(5);
        opts.set_max_total_wal_size(16 * 1024 * 1024);

        let db = DB::open(&opts, path)
            .map_err(|e| ShardError::InternalError(format!("failed to open catalog db: {}", e)))?;
        Ok(Self {
            db,
            commit_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl CatalogStore for RocksCatalogStore {
    async fn get(&self, key: &str) -> ShardResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    async fn scan_prefix(&self, prefix: &str) -> ShardResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    async fn current_version(&self) -> ShardResult<i64> {
        decode_version(self.db.get(VERSION_KEY.as_bytes())?)
    }

    async fn commit(
        &self,
        expected_version: i64,
        new_version: i64,
        ops: Vec<WriteOp>,
    ) -> ShardResult<()> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| ShardError::InternalError("catalog commit lock poisoned".into()))?;

        let current = decode_version(self.db.get(VERSION_KEY.as_bytes())?)?;
        if current != expected_version {
            return Err(ShardError::Conflict(format!(
                "catalog version is {}, commit expected {}",
                current, expected_version
            )));
        }

        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.put(key.as_bytes(), &value),
                WriteOp::Delete { key } => batch.delete(key.as_bytes()),
            }
        }
        batch.put(VERSION_KEY.as_bytes(), new_version.to_string().as_bytes());
        self.db.write(batch)?;
        Ok(())
    }
}
