//! Four-phase reshard executor
//!
//! Drives a job through precopy, deltasync, cutover, and validation. The job
//! record in the catalog is the canonical progress marker: each phase reads
//! the record, does its work, and commits the transition, so a restarted
//! executor resumes where the last one stopped. The cutover commit is the
//! single linearization point that moves vnode ownership from sources to
//! targets.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::mover::{DataMover, MovedRow, RangeDigest};
use crate::catalog::model::{JobStatus, JobType, ReshardJob, Shard, ShardStatus};
use crate::catalog::{Catalog, CatalogOp};
use crate::config::Config;
use crate::error::{ShardError, ShardResult};
use crate::ring::position;

/// Successor lookup restricted to the moving vnode positions. For keys owned
/// by the job's sources this agrees with the full ring.
struct VnodePlan {
    /// (position, target shard id), sorted by position.
    entries: Vec<(u64, String)>,
}

impl VnodePlan {
    fn from_job(job: &ReshardJob) -> Self {
        let mut entries: Vec<(u64, String)> = job
            .vnode_plan
            .iter()
            .flat_map(|(target, positions)| {
                positions.iter().map(move |p| (*p, target.clone()))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Self { entries }
    }

    fn target_for_key(&self, key: &str) -> Option<&str> {
        self.target_for_position(position(key))
    }

    fn target_for_position(&self, pos: u64) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.entries.partition_point(|(p, _)| *p < pos);
        let entry = if index == self.entries.len() {
            // Wrap around to the first position
            &self.entries[0]
        } else {
            &self.entries[index]
        };
        Some(entry.1.as_str())
    }
}

/// Deterministic assignment of the moving vnodes to the targets.
///
/// A split deals the source's positions round-robin over the sorted target
/// ids; a merge hands the union of all source positions to the single
/// target. Recomputable from the catalog at job start, persisted in the job
/// record afterwards.
fn build_plan(
    job_type: JobType,
    sources: &[Shard],
    target_ids: &[String],
) -> ShardResult<HashMap<String, Vec<u64>>> {
    if target_ids.is_empty() {
        return Err(ShardError::Validation("reshard job has no targets".into()));
    }
    let mut plan: HashMap<String, Vec<u64>> = target_ids
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();

    match job_type {
        JobType::Split => {
            let source = sources
                .first()
                .ok_or_else(|| ShardError::Validation("split has no source".into()))?;
            let mut targets: Vec<&String> = target_ids.iter().collect();
            targets.sort();
            let mut positions = source.vnodes.clone();
            positions.sort_unstable();
            for (index, pos) in positions.into_iter().enumerate() {
                plan.get_mut(targets[index % targets.len()])
                    .expect("plan seeded for every target")
                    .push(pos);
            }
        }
        JobType::Merge => {
            let target = &target_ids[0];
            let union = plan.get_mut(target).expect("plan seeded for every target");
            for source in sources {
                union.extend(source.vnodes.iter().copied());
            }
            union.sort_unstable();
            union.dedup();
        }
    }
    Ok(plan)
}

pub struct Resharder {
    catalog: Arc<Catalog>,
    mover: Arc<dyn DataMover>,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
}

impl Resharder {
    pub fn new(
        catalog: Arc<Catalog>,
        mover: Arc<dyn DataMover>,
        config: Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            catalog,
            mover,
            config,
            shutdown,
        }
    }

    fn canceled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive a job to a terminal state, logging instead of propagating; the
    /// job record carries the outcome.
    pub async fn run(self: Arc<Self>, job_id: String) {
        match self.drive(&job_id).await {
            Ok(()) => {}
            Err(e) => {
                error!("reshard job {} failed: {}", job_id, e);
                if let Err(fail_err) = self.fail_job(&job_id, &e.to_string()).await {
                    error!("could not record failure of job {}: {}", job_id, fail_err);
                }
            }
        }
    }

    async fn drive(&self, job_id: &str) -> ShardResult<()> {
        loop {
            // Cancellation is honored at phase boundaries only; a mid-phase
            // cancel fails the job rather than rolling back silently.
            if self.canceled() {
                return Err(ShardError::Canceled(format!(
                    "shutdown while job {} was in progress",
                    job_id
                )));
            }
            let job = self.catalog.get_job(job_id).await?;
            match job.status {
                JobStatus::Pending => self.start(job).await?,
                JobStatus::Precopy => self.precopy(job).await?,
                JobStatus::Deltasync => self.deltasync(job).await?,
                JobStatus::Cutover => self.cutover(job).await?,
                JobStatus::Validation => self.validate(job).await?,
                JobStatus::Completed | JobStatus::Failed => return Ok(()),
            }
        }
    }

    fn source_shards(&self, job: &ReshardJob) -> ShardResult<Vec<Shard>> {
        job.source_shards
            .iter()
            .map(|id| self.catalog.get_shard(id))
            .collect()
    }

    fn target_primary(&self, target_id: &str) -> ShardResult<crate::catalog::model::Endpoint> {
        Ok(self.catalog.get_shard(target_id)?.primary)
    }

    /// Pending -> precopy: fix the vnode plan and the key total.
    async fn start(&self, mut job: ReshardJob) -> ShardResult<()> {
        let sources = self.source_shards(&job)?;
        for source in &sources {
            if source.status != ShardStatus::Migrating {
                return Err(ShardError::Invariant(format!(
                    "source {} is {} but the job expects migrating",
                    source.id, source.status
                )));
            }
        }

        job.vnode_plan = build_plan(job.job_type, &sources, &job.target_shards)?;
        let mut total = 0u64;
        for source in &sources {
            total += self.mover.count_keys(&source.primary).await?;
        }
        job.total_keys = total;
        job.transition(JobStatus::Precopy)?;

        info!(
            "reshard job {} entering precopy: {} keys across {} source(s)",
            job.id,
            total,
            sources.len()
        );
        self.put_job(job).await
    }

    /// Bulk-copy every row whose key moves, within the precopy budget.
    async fn precopy(&self, job: ReshardJob) -> ShardResult<()> {
        let job_id = job.id.clone();
        let copied = match tokio::time::timeout(self.config.precopy_timeout(), self.copy_all(job))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ShardError::Timeout(format!(
                    "precopy for job {} exceeded {:?}",
                    job_id,
                    self.config.precopy_timeout()
                )))
            }
        };

        let mut job = self.catalog.get_job(&job_id).await?;
        job.keys_migrated = copied;
        job.transition(JobStatus::Deltasync)?;
        info!("reshard job {} precopy done, {} keys copied", job_id, copied);
        self.put_job(job).await
    }

    async fn copy_all(&self, mut job: ReshardJob) -> ShardResult<u64> {
        let plan = VnodePlan::from_job(&job);
        let sources = self.source_shards(&job)?;
        let batch_size = self.config.reshard.batch_size;
        let mut copied = 0u64;

        for source in &sources {
            let mut cursor: Option<String> = None;
            loop {
                let rows = self
                    .mover
                    .scan_batch(&source.primary, cursor.as_deref(), batch_size)
                    .await?;
                if rows.is_empty() {
                    break;
                }
                cursor = Some(rows.last().expect("non-empty batch").key.clone());
                copied += rows.len() as u64;

                self.replay_rows(&plan, rows).await?;

                // Keep the durable progress marker current
                job.keys_migrated = copied;
                job.progress = if job.total_keys > 0 {
                    (copied as f64 / job.total_keys as f64).min(1.0)
                } else {
                    1.0
                };
                self.put_job(job.clone()).await?;
            }
        }
        Ok(copied)
    }

    /// Route rows to their planned targets and upsert them.
    async fn replay_rows(&self, plan: &VnodePlan, rows: Vec<MovedRow>) -> ShardResult<usize> {
        let mut by_target: HashMap<String, Vec<MovedRow>> = HashMap::new();
        let mut replayed = 0usize;
        for row in rows {
            match plan.target_for_key(&row.key) {
                Some(target) => {
                    replayed += 1;
                    by_target.entry(target.to_string()).or_default().push(row);
                }
                None => {
                    warn!("row '{}' maps to no planned vnode, skipping", row.key);
                }
            }
        }
        for (target_id, rows) in by_target {
            let endpoint = self.target_primary(&target_id)?;
            self.mover.upsert_batch(&endpoint, &rows).await?;
        }
        Ok(replayed)
    }

    /// Replay incremental changes until a round stays under the cutover lag
    /// threshold.
    async fn deltasync(&self, job: ReshardJob) -> ShardResult<()> {
        let plan = VnodePlan::from_job(&job);
        let sources = self.source_shards(&job)?;
        let batch_size = self.config.reshard.batch_size;
        let threshold = self.config.reshard.cutover_lag_rows;

        let mut watermark: DateTime<Utc> = job.started_at;
        let mut converged = false;
        for round in 0..self.config.reshard.max_delta_rounds {
            let round_start = Utc::now();
            let mut pending = 0u64;
            for source in &sources {
                let rows = self
                    .mover
                    .scan_changed_since(&source.primary, watermark, batch_size)
                    .await?;
                pending += rows.len() as u64;
                self.replay_rows(&plan, rows).await?;
            }
            if pending <= threshold {
                info!(
                    "reshard job {} deltasync converged after {} round(s), {} rows behind",
                    job.id,
                    round + 1,
                    pending
                );
                converged = true;
                break;
            }
            watermark = round_start;
        }
        if !converged {
            return Err(ShardError::Timeout(format!(
                "deltasync for job {} never fell under {} rows",
                job.id, threshold
            )));
        }

        let mut job = self.catalog.get_job(&job.id).await?;
        job.transition(JobStatus::Cutover)?;
        self.put_job(job).await
    }

    /// The single atomic catalog commit that swaps vnode ownership: sources
    /// go readonly and drop the moving vnodes, targets claim them, and the
    /// job advances, all under one version bump.
    async fn cutover(&self, job: ReshardJob) -> ShardResult<()> {
        let job_id = job.id.clone();
        let version = self
            .catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut ops = Vec::new();
                for source_id in &job.source_shards {
                    let mut source = snapshot
                        .shards
                        .get(source_id)
                        .cloned()
                        .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", source_id)))?;
                    if source.status != ShardStatus::Migrating {
                        return Err(ShardError::Invariant(format!(
                            "cutover found source {} in status {}",
                            source.id, source.status
                        )));
                    }
                    source.status = ShardStatus::Readonly;
                    source.vnodes.clear();
                    source.touch();
                    ops.push(CatalogOp::PutShard(source));
                }
                for (target_id, positions) in &job.vnode_plan {
                    let mut target = snapshot
                        .shards
                        .get(target_id)
                        .cloned()
                        .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", target_id)))?;
                    let mut positions = positions.clone();
                    positions.sort_unstable();
                    target.vnodes = positions;
                    target.touch();
                    ops.push(CatalogOp::PutShard(target));
                }
                let mut job = job.clone();
                job.transition(JobStatus::Validation)?;
                ops.push(CatalogOp::PutJob(job));
                Ok(ops)
            })
            .await?;

        info!(
            "reshard job {} cut over at catalog version {}",
            job_id, version
        );
        Ok(())
    }

    /// Compare per-target row counts and checksums between the now-readonly
    /// sources and the targets. A mismatch fails the job; post-cutover
    /// failures are left for the operator, never rolled back automatically.
    async fn validate(&self, job: ReshardJob) -> ShardResult<()> {
        let plan = VnodePlan::from_job(&job);
        let sources = self.source_shards(&job)?;
        let batch_size = self.config.reshard.batch_size;

        // Enumerate the moved keys per target from the frozen sources
        let mut expected: HashMap<String, RangeDigest> = HashMap::new();
        let mut keys_by_target: HashMap<String, Vec<String>> = HashMap::new();
        for source in &sources {
            let mut cursor: Option<String> = None;
            loop {
                let rows = self
                    .mover
                    .scan_batch(&source.primary, cursor.as_deref(), batch_size)
                    .await?;
                if rows.is_empty() {
                    break;
                }
                cursor = Some(rows.last().expect("non-empty batch").key.clone());

                let mut source_keys: HashMap<String, Vec<String>> = HashMap::new();
                for row in &rows {
                    if let Some(target) = plan.target_for_key(&row.key) {
                        source_keys
                            .entry(target.to_string())
                            .or_default()
                            .push(row.key.clone());
                    }
                }
                for (target, keys) in source_keys {
                    let digest = self.mover.checksum_keys(&source.primary, &keys).await?;
                    let entry = expected.entry(target.clone()).or_insert(RangeDigest {
                        count: 0,
                        checksum: 0,
                    });
                    entry.count += digest.count;
                    entry.checksum = entry.checksum.wrapping_add(digest.checksum);
                    keys_by_target.entry(target).or_default().extend(keys);
                }
            }
        }

        for (target_id, expected_digest) in &expected {
            let endpoint = self.target_primary(target_id)?;
            let keys = &keys_by_target[target_id];
            let actual = self.mover.checksum_keys(&endpoint, keys).await?;
            if actual != *expected_digest {
                return Err(ShardError::Invariant(format!(
                    "validation mismatch on {}: expected {} rows (checksum {}), found {} (checksum {})",
                    target_id,
                    expected_digest.count,
                    expected_digest.checksum,
                    actual.count,
                    actual.checksum
                )));
            }
        }

        // Retire the sources and close the job in one commit
        let job_id = job.id.clone();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut ops = Vec::new();
                for source_id in &job.source_shards {
                    if let Some(source) = snapshot.shards.get(source_id) {
                        let mut source = source.clone();
                        if source.status == ShardStatus::Readonly {
                            source.status = ShardStatus::Inactive;
                            source.touch();
                            ops.push(CatalogOp::PutShard(source));
                        }
                    }
                }
                let mut job = job.clone();
                job.transition(JobStatus::Completed)?;
                ops.push(CatalogOp::PutJob(job));
                Ok(ops)
            })
            .await?;

        info!("reshard job {} completed", job_id);
        Ok(())
    }

    async fn put_job(&self, job: ReshardJob) -> ShardResult<()> {
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |_snapshot| {
                Ok(vec![CatalogOp::PutJob(job.clone())])
            })
            .await?;
        Ok(())
    }

    /// Record a failure on the job and, when the cutover has not happened
    /// yet, return the sources to active on the old mapping.
    async fn fail_job(&self, job_id: &str, message: &str) -> ShardResult<()> {
        let job = self.catalog.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        let pre_cutover = matches!(
            job.status,
            JobStatus::Pending | JobStatus::Precopy | JobStatus::Deltasync | JobStatus::Cutover
        );
        let message = message.to_string();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut ops = Vec::new();
                if pre_cutover {
                    for source_id in &job.source_shards {
                        if let Some(source) = snapshot.shards.get(source_id) {
                            if source.status == ShardStatus::Migrating {
                                let mut source = source.clone();
                                source.status = ShardStatus::Active;
                                source.touch();
                                ops.push(CatalogOp::PutShard(source));
                            }
                        }
                    }
                }
                let mut job = job.clone();
                job.fail(message.clone());
                ops.push(CatalogOp::PutJob(job));
                Ok(ops)
            })
            .await?;
        Ok(())
    }
}
