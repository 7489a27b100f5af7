//! Versioned catalog of shards, tenants, and reshard jobs
//!
//! The catalog is the only shared mutable state in the system. All mutation
//! goes through `Catalog::commit`, which serializes writers on a version CAS
//! in the backing store; every committed mutation bumps the catalog version
//! by exactly one, so observed versions are strictly increasing.

pub mod model;
pub mod rocks;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ShardError, ShardResult};
use model::{CatalogSnapshot, ClientApp, JobStatus, ReshardJob, Shard};
use store::{
    app_key, job_key, shard_key, CatalogStore, WriteOp, APP_PREFIX, JOB_PREFIX, SHARD_PREFIX,
};

pub use model::{
    ClientAppStatus, Endpoint, JobType, QuotaTier, ShardStatus,
};
pub use rocks::RocksCatalogStore;
pub use store::MemoryCatalogStore;

/// One entity mutation inside a catalog commit. A single commit may carry
/// several (the reshard cutover swaps multiple shards and the job record in
/// one version bump).
#[derive(Debug, Clone)]
pub enum CatalogOp {
    PutShard(Shard),
    DeleteShard(String),
    PutApp(ClientApp),
    PutJob(ReshardJob),
}

pub struct Catalog {
    store: Arc<dyn CatalogStore>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    watch_tx: watch::Sender<Arc<CatalogSnapshot>>,
}

impl Catalog {
    /// Open the catalog, loading the current state from the store.
    pub async fn open(store: Arc<dyn CatalogStore>) -> ShardResult<Self> {
        let snapshot = Arc::new(Self::load(store.as_ref()).await?);
        let (watch_tx, _) = watch::channel(snapshot.clone());
        Ok(Self {
            store,
            snapshot: RwLock::new(snapshot),
            watch_tx,
        })
    }

    async fn load(store: &dyn CatalogStore) -> ShardResult<CatalogSnapshot> {
        let version = store.current_version().await?;
        let mut snapshot = CatalogSnapshot::empty();
        snapshot.version = version;

        for (_, value) in store.scan_prefix(SHARD_PREFIX).await? {
            let shard: Shard = serde_json::from_slice(&value)?;
            snapshot.shards.insert(shard.id.clone(), shard);
        }
        for (_, value) in store.scan_prefix(APP_PREFIX).await? {
            let app: ClientApp = serde_json::from_slice(&value)?;
            snapshot.apps.insert(app.id.clone(), app);
        }
        Ok(snapshot)
    }

    /// The current consistent snapshot. Cheap; clones an Arc.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().clone()
    }

    /// Monotonic stream of snapshots. Consumers may miss intermediate
    /// versions but never observe them out of order.
    pub fn watch(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.watch_tx.subscribe()
    }

    /// Re-read from the store. Under a backend outage the last known
    /// snapshot is returned with `stale` set instead of an error.
    pub async fn refresh(&self) -> Arc<CatalogSnapshot> {
        match Self::load(self.store.as_ref()).await {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                self.install(fresh.clone());
                fresh
            }
            Err(e) => {
                warn!("catalog refresh failed, serving stale snapshot: {}", e);
                let mut stale = (*self.snapshot()).clone();
                stale.stale = true;
                let stale = Arc::new(stale);
                *self.snapshot.write() = stale.clone();
                stale
            }
        }
    }

    /// Install a snapshot if it is at least as new as the cached one.
    fn install(&self, fresh: Arc<CatalogSnapshot>) {
        let mut cached = self.snapshot.write();
        if fresh.version >= cached.version {
            *cached = fresh.clone();
            // Receivers may be gone; that is fine
            let _ = self.watch_tx.send(fresh);
        }
    }

    /// Commit a batch of mutations as one version bump.
    ///
    /// Returns the new catalog version. A lost CAS surfaces as `Conflict`
    /// after the cached snapshot has been refreshed, so the caller can
    /// re-read and retry.
    pub async fn commit(&self, ops: Vec<CatalogOp>) -> ShardResult<i64> {
        let current = self.snapshot();
        let new_version = current.version + 1;

        let mut writes = Vec::with_capacity(ops.len());
        for op in &ops {
            writes.push(match op {
                CatalogOp::PutShard(shard) => WriteOp::Put {
                    key: shard_key(&shard.id),
                    value: serde_json::to_vec(shard)?,
                },
                CatalogOp::DeleteShard(id) => WriteOp::Delete {
                    key: shard_key(id),
                },
                CatalogOp::PutApp(app) => WriteOp::Put {
                    key: app_key(&app.id),
                    value: serde_json::to_vec(app)?,
                },
                CatalogOp::PutJob(job) => WriteOp::Put {
                    key: job_key(&job.id),
                    value: serde_json::to_vec(job)?,
                },
            });
        }

        match self.store.commit(current.version, new_version, writes).await {
            Ok(()) => {
                let mut fresh = (*current).clone();
                fresh.version = new_version;
                fresh.updated_at = chrono::Utc::now();
                fresh.stale = false;
                for op in ops {
                    match op {
                        CatalogOp::PutShard(shard) => {
                            fresh.shards.insert(shard.id.clone(), shard);
                        }
                        CatalogOp::DeleteShard(id) => {
                            fresh.shards.remove(&id);
                        }
                        CatalogOp::PutApp(app) => {
                            fresh.apps.insert(app.id.clone(), app);
                        }
                        // Jobs are read straight from the store
                        CatalogOp::PutJob(_) => {}
                    }
                }
                self.install(Arc::new(fresh));
                debug!("catalog committed version {}", new_version);
                Ok(new_version)
            }
            Err(ShardError::Conflict(msg)) => {
                // Someone else won; pick up their state before retrying
                self.refresh().await;
                Err(ShardError::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Run `build` against a fresh snapshot and commit its ops, retrying up
    /// to `attempts` times on version conflicts with jittered backoff.
    pub async fn commit_with_retry<F>(&self, attempts: u32, build: F) -> ShardResult<i64>
    where
        F: Fn(&CatalogSnapshot) -> ShardResult<Vec<CatalogOp>>,
    {
        let mut last_err = ShardError::Conflict("no attempts made".into());
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                let jitter = {
                    use rand::Rng;
                    rand::thread_rng().gen_range(10..50)
                };
                tokio::time::sleep(Duration::from_millis(jitter * attempt as u64)).await;
            }
            let snapshot = self.snapshot();
            let ops = build(&snapshot)?;
            match self.commit(ops).await {
                Ok(version) => return Ok(version),
                Err(ShardError::Conflict(msg)) => {
                    debug!("catalog commit conflict (attempt {}): {}", attempt + 1, msg);
                    last_err = ShardError::Conflict(msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub fn get_shard(&self, id: &str) -> ShardResult<Shard> {
        self.snapshot()
            .shards
            .get(id)
            .cloned()
            .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", id)))
    }

    pub fn list_shards(&self, tenant_id: Option<&str>) -> Vec<Shard> {
        let snapshot = self.snapshot();
        let mut shards: Vec<Shard> = snapshot
            .shards
            .values()
            .filter(|s| tenant_id.map(|t| s.tenant_id == t).unwrap_or(true))
            .cloned()
            .collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        shards
    }

    pub fn get_app(&self, id: &str) -> ShardResult<ClientApp> {
        self.snapshot()
            .apps
            .get(id)
            .cloned()
            .ok_or_else(|| ShardError::NotFound(format!("client app '{}'", id)))
    }

    pub fn list_apps(&self) -> Vec<ClientApp> {
        let snapshot = self.snapshot();
        let mut apps: Vec<ClientApp> = snapshot.apps.values().cloned().collect();
        apps.sort_by(|a, b| a.id.cmp(&b.id));
        apps
    }

    /// Jobs always read through to the store; their records are the canonical
    /// progress markers for resumable migrations.
    pub async fn get_job(&self, id: &str) -> ShardResult<ReshardJob> {
        match self.store.get(&job_key(id)).await? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Err(ShardError::NotFound(format!("reshard job '{}'", id))),
        }
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> ShardResult<Vec<ReshardJob>> {
        let mut jobs = Vec::new();
        for (_, value) in self.store.scan_prefix(JOB_PREFIX).await? {
            let job: ReshardJob = serde_json::from_slice(&value)?;
            if status.map(|s| job.status == s).unwrap_or(true) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(jobs)
    }

    /// The non-terminal job touching `shard_id`, if one exists. Used to
    /// serialize reshard activity per shard.
    pub async fn active_job_for(&self, shard_id: &str) -> ShardResult<Option<ReshardJob>> {
        let jobs = self.list_jobs(None).await?;
        Ok(jobs
            .into_iter()
            .find(|j| !j.status.is_terminal() && j.involves(shard_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{JobType, QuotaTier, ShardStatus};

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "db1".into(),
            port: 5432,
            database: "app".into(),
            user: "app".into(),
            password: "pw".into(),
            sslmode: "prefer".into(),
        }
    }

    async fn open_catalog() -> (Catalog, Arc<MemoryCatalogStore>) {
        let store = Arc::new(MemoryCatalogStore::new());
        let catalog = Catalog::open(store.clone()).await.unwrap();
        (catalog, store)
    }

    #[tokio::test]
    async fn test_open_empty() {
        let (catalog, _) = open_catalog().await;
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.shards.is_empty());
    }

    #[tokio::test]
    async fn test_commit_bumps_version_and_updates_snapshot() {
        let (catalog, _) = open_catalog().await;
        let shard = Shard::new("orders-1".into(), "app-1".into(), endpoint());
        let id = shard.id.clone();

        let version = catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap();
        assert_eq!(version, 1);

        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.shards.contains_key(&id));
        assert_eq!(catalog.get_shard(&id).unwrap().name, "orders-1");
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let (catalog, _) = open_catalog().await;
        let mut observed = Vec::new();
        for i in 0..5 {
            let shard = Shard::new(format!("s{}", i), "app-1".into(), endpoint());
            observed.push(catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap());
        }
        for pair in observed.windows(2) {
            assert!(pair[1] > pair[0], "versions not increasing: {:?}", observed);
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_conflict_and_recover() {
        let store = Arc::new(MemoryCatalogStore::new());
        let a = Catalog::open(store.clone()).await.unwrap();
        let b = Catalog::open(store.clone()).await.unwrap();

        a.commit(vec![CatalogOp::PutShard(Shard::new(
            "a1".into(),
            "t".into(),
            endpoint(),
        ))])
        .await
        .unwrap();

        // b still has version 0 cached; its commit must lose the CAS
        let err = b
            .commit(vec![CatalogOp::PutShard(Shard::new(
                "b1".into(),
                "t".into(),
                endpoint(),
            ))])
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Conflict(_)));

        // The conflict refreshed b's snapshot; a retry succeeds
        let version = b
            .commit(vec![CatalogOp::PutShard(Shard::new(
                "b1".into(),
                "t".into(),
                endpoint(),
            ))])
            .await
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(b.snapshot().shards.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_with_retry_wins_eventually() {
        let store = Arc::new(MemoryCatalogStore::new());
        let a = Catalog::open(store.clone()).await.unwrap();
        let b = Catalog::open(store.clone()).await.unwrap();

        a.commit(vec![CatalogOp::PutShard(Shard::new(
            "a1".into(),
            "t".into(),
            endpoint(),
        ))])
        .await
        .unwrap();

        // b's cached snapshot is stale; commit_with_retry re-reads and wins
        let version = b
            .commit_with_retry(3, |_snapshot| {
                Ok(vec![CatalogOp::PutShard(Shard::new(
                    "b1".into(),
                    "t".into(),
                    endpoint(),
                ))])
            })
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_watch_sees_new_versions_in_order() {
        let (catalog, _) = open_catalog().await;
        let mut rx = catalog.watch();
        assert_eq!(rx.borrow().version, 0);

        catalog
            .commit(vec![CatalogOp::PutShard(Shard::new(
                "s1".into(),
                "t".into(),
                endpoint(),
            ))])
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 1);

        catalog
            .commit(vec![CatalogOp::PutShard(Shard::new(
                "s2".into(),
                "t".into(),
                endpoint(),
            ))])
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_under_outage() {
        let (catalog, store) = open_catalog().await;
        catalog
            .commit(vec![CatalogOp::PutShard(Shard::new(
                "s1".into(),
                "t".into(),
                endpoint(),
            ))])
            .await
            .unwrap();

        store.set_unavailable(true);
        let snapshot = catalog.refresh().await;
        assert!(snapshot.stale);
        // Data from the last good read is still served
        assert_eq!(snapshot.shards.len(), 1);

        store.set_unavailable(false);
        let snapshot = catalog.refresh().await;
        assert!(!snapshot.stale);
    }

    #[tokio::test]
    async fn test_delete_shard() {
        let (catalog, _) = open_catalog().await;
        let shard = Shard::new("s1".into(), "t".into(), endpoint());
        let id = shard.id.clone();
        catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap();
        catalog
            .commit(vec![CatalogOp::DeleteShard(id.clone())])
            .await
            .unwrap();
        assert!(catalog.get_shard(&id).is_err());
    }

    #[tokio::test]
    async fn test_job_roundtrip_and_active_lookup() {
        let (catalog, _) = open_catalog().await;
        let job = ReshardJob::new(JobType::Split, vec!["s1".into()], vec!["s2".into(), "s3".into()]);
        let id = job.id.clone();
        catalog.commit(vec![CatalogOp::PutJob(job)]).await.unwrap();

        let read = catalog.get_job(&id).await.unwrap();
        assert_eq!(read.status, model::JobStatus::Pending);

        let active = catalog.active_job_for("s1").await.unwrap();
        assert!(active.is_some());
        assert!(catalog.active_job_for("s9").await.unwrap().is_none());

        // Terminal jobs no longer count as active
        let mut done = read.clone();
        done.fail("operator abort");
        catalog.commit(vec![CatalogOp::PutJob(done)]).await.unwrap();
        assert!(catalog.active_job_for("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_status() {
        let (catalog, _) = open_catalog().await;
        let job1 = ReshardJob::new(JobType::Split, vec!["s1".into()], vec![]);
        let mut job2 = ReshardJob::new(JobType::Merge, vec!["s2".into()], vec![]);
        job2.fail("boom");
        catalog.commit(vec![CatalogOp::PutJob(job1)]).await.unwrap();
        catalog.commit(vec![CatalogOp::PutJob(job2)]).await.unwrap();

        let pending = catalog.list_jobs(Some(model::JobStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        let failed = catalog.list_jobs(Some(model::JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        let all = catalog.list_jobs(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_app_roundtrip() {
        let (catalog, _) = open_catalog().await;
        let app = ClientApp::new("orders".into(), QuotaTier::Pro, Some("ord-".into()));
        let id = app.id.clone();
        catalog.commit(vec![CatalogOp::PutApp(app)]).await.unwrap();

        let read = catalog.get_app(&id).unwrap();
        assert_eq!(read.tier, QuotaTier::Pro);
        assert_eq!(catalog.list_apps().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_restores_state() {
        let store = Arc::new(MemoryCatalogStore::new());
        {
            let catalog = Catalog::open(store.clone()).await.unwrap();
            let mut shard = Shard::new("s1".into(), "t".into(), endpoint());
            shard.status = ShardStatus::Readonly;
            catalog.commit(vec![CatalogOp::PutShard(shard)]).await.unwrap();
        }
        let catalog = Catalog::open(store).await.unwrap();
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.shards.len(), 1);
    }
}
