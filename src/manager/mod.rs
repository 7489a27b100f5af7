//! Control-plane operations on shards, tenants, and reshard jobs
//!
//! The manager owns shard lifecycle: creation behind durable quota checks
//! and probe-validated endpoints, status transitions, replica promotion, and
//! the initiation of split/merge jobs. Every mutation goes through the
//! catalog's CAS commit with bounded retry; concurrent controllers re-read
//! and re-evaluate instead of overwriting.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::model::{
    ClientApp, ClientAppStatus, Endpoint, JobStatus, JobType, QuotaTier, ReshardJob, Shard,
    ShardStatus,
};
use crate::catalog::{Catalog, CatalogOp};
use crate::config::Config;
use crate::error::{ShardError, ShardResult};
use crate::pool::Connector;
use crate::reshard::Resharder;

/// Connection descriptor in requests: either structured or a DSN string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointOrDsn {
    Dsn(String),
    Endpoint(Endpoint),
}

impl EndpointOrDsn {
    pub fn resolve(&self) -> ShardResult<Endpoint> {
        match self {
            EndpointOrDsn::Endpoint(ep) => Ok(ep.clone()),
            EndpointOrDsn::Dsn(dsn) => Endpoint::from_dsn(dsn),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateShardRequest {
    pub name: String,
    pub tenant_id: String,
    pub endpoint: Option<EndpointOrDsn>,
    #[serde(default)]
    pub replicas: Vec<EndpointOrDsn>,
}

/// Target description for split/merge. Name and endpoint fall back to
/// source-derived defaults when omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetSpec {
    pub name: Option<String>,
    pub endpoint: Option<EndpointOrDsn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitRequest {
    pub shard_id: String,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    pub source_shards: Vec<String>,
    #[serde(default)]
    pub target: Option<TargetSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
    #[serde(default)]
    pub tier: QuotaTier,
    #[serde(default)]
    pub key_prefix: Option<String>,
}

pub struct ShardManager {
    catalog: Arc<Catalog>,
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    resharder: RwLock<Option<Arc<Resharder>>>,
}

impl ShardManager {
    pub fn new(catalog: Arc<Catalog>, connector: Arc<dyn Connector>, config: Arc<Config>) -> Self {
        Self {
            catalog,
            connector,
            config,
            resharder: RwLock::new(None),
        }
    }

    /// Attach the executor that runs split/merge jobs. Without one, jobs
    /// stay pending until an executor picks them up.
    pub fn set_resharder(&self, resharder: Arc<Resharder>) {
        *self.resharder.write() = Some(resharder);
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Live-connection probe; shard activation paths require it to pass.
    async fn probe(&self, endpoint: &Endpoint) -> ShardResult<()> {
        let mut conn = self.connector.connect(endpoint).await?;
        conn.ping().await
    }

    pub async fn create_shard(&self, req: CreateShardRequest) -> ShardResult<Shard> {
        if req.tenant_id.is_empty() {
            return Err(ShardError::Validation("tenant_id is required".into()));
        }
        let tenant = self
            .catalog
            .get_app(&req.tenant_id)
            .map_err(|_| ShardError::Validation(format!("unknown tenant '{}'", req.tenant_id)))?;
        if tenant.status != ClientAppStatus::Active {
            return Err(ShardError::Validation(format!(
                "tenant '{}' is inactive",
                req.tenant_id
            )));
        }

        let endpoint = req
            .endpoint
            .as_ref()
            .ok_or_else(|| {
                ShardError::Validation("a database endpoint or DSN is required".into())
            })?
            .resolve()?;
        self.probe(&endpoint).await?;

        let mut replicas = Vec::with_capacity(req.replicas.len());
        for replica in &req.replicas {
            replicas.push(replica.resolve()?);
        }

        let mut shard = Shard::new(req.name.clone(), req.tenant_id.clone(), endpoint);
        shard.replicas = replicas;
        shard.vnodes = crate::ring::vnode_positions(&shard.id, self.config.vnode_count);

        let committed = shard.clone();
        let tier = tenant.tier;
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                // Quota and uniqueness are enforced against the durable
                // state inside the retry loop, so a lost CAS re-checks.
                let owned = snapshot.shards_of_tenant(&committed.tenant_id);
                let cap = tier.max_shards();
                if cap >= 0 && owned.len() as i32 >= cap {
                    return Err(ShardError::Validation(format!(
                        "quota exceeded: tenant '{}' is capped at {} shard(s)",
                        committed.tenant_id, cap
                    )));
                }
                if owned.iter().any(|s| s.name == committed.name) {
                    return Err(ShardError::Validation(format!(
                        "shard name '{}' already exists for tenant '{}'",
                        committed.name, committed.tenant_id
                    )));
                }
                Ok(vec![CatalogOp::PutShard(committed.clone())])
            })
            .await?;

        info!(
            "created shard {} ({} vnodes) for tenant {}",
            shard.id,
            shard.vnodes.len(),
            shard.tenant_id
        );
        Ok(shard)
    }

    pub async fn delete_shard(&self, shard_id: &str) -> ShardResult<()> {
        if let Some(job) = self.catalog.active_job_for(shard_id).await? {
            return Err(ShardError::Validation(format!(
                "shard '{}' is referenced by reshard job '{}'",
                shard_id, job.id
            )));
        }

        let shard_id = shard_id.to_string();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let shard = snapshot
                    .shards
                    .get(&shard_id)
                    .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", shard_id)))?;
                if shard.status == ShardStatus::Active {
                    return Err(ShardError::Validation(format!(
                        "cannot delete active shard '{}'",
                        shard_id
                    )));
                }
                Ok(vec![CatalogOp::DeleteShard(shard_id.clone())])
            })
            .await?;
        Ok(())
    }

    pub async fn update_shard_status(
        &self,
        shard_id: &str,
        status: ShardStatus,
    ) -> ShardResult<Shard> {
        if status == ShardStatus::Active {
            // Activation requires a live primary
            let shard = self.catalog.get_shard(shard_id)?;
            self.probe(&shard.primary).await?;
        }

        let shard_id = shard_id.to_string();
        let captured = shard_id.clone();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut shard = snapshot
                    .shards
                    .get(&captured)
                    .cloned()
                    .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", captured)))?;
                if !shard.status.can_transition(status) {
                    return Err(ShardError::Validation(format!(
                        "invalid status transition {} -> {} for shard '{}'",
                        shard.status, status, captured
                    )));
                }
                shard.status = status;
                shard.touch();
                Ok(vec![CatalogOp::PutShard(shard)])
            })
            .await?;
        self.catalog.get_shard(&shard_id)
    }

    /// Swap a replica in as the primary. Atomic: the old primary joins the
    /// replica list and the version bumps once. Promoting the endpoint that
    /// is already primary is a recorded no-op, so repeated failover attempts
    /// converge instead of erroring.
    pub async fn promote_replica(&self, shard_id: &str, replica: Endpoint) -> ShardResult<Shard> {
        let shard_id = shard_id.to_string();
        let captured = shard_id.clone();
        let replica_addr = replica.addr();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut shard = snapshot
                    .shards
                    .get(&captured)
                    .cloned()
                    .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", captured)))?;

                if shard.primary.addr() == replica_addr {
                    shard.touch();
                    return Ok(vec![CatalogOp::PutShard(shard)]);
                }

                let index = shard
                    .replicas
                    .iter()
                    .position(|r| r.addr() == replica_addr)
                    .ok_or_else(|| {
                        ShardError::Validation(format!(
                            "'{}' is not a replica of shard '{}'",
                            replica_addr, captured
                        ))
                    })?;
                let promoted = shard.replicas.remove(index);
                let demoted = std::mem::replace(&mut shard.primary, promoted);
                shard.replicas.push(demoted);
                shard.touch();
                Ok(vec![CatalogOp::PutShard(shard)])
            })
            .await?;

        let shard = self.catalog.get_shard(&shard_id)?;
        info!(
            "promoted {} to primary of shard {}",
            shard.primary.addr(),
            shard_id
        );
        Ok(shard)
    }

    fn spawn_job(&self, job_id: &str) {
        if let Some(resharder) = self.resharder.read().clone() {
            let job_id = job_id.to_string();
            tokio::spawn(resharder.run(job_id));
        }
    }

    fn resolve_target(
        &self,
        spec: &TargetSpec,
        source: &Shard,
        suffix: usize,
    ) -> ShardResult<Shard> {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", source.name, suffix));
        let endpoint = match &spec.endpoint {
            Some(ep) => ep.resolve()?,
            // Without a provisioned endpoint the target shares the source's
            // database; the split is then a ring-level rebalance.
            None => source.primary.clone(),
        };
        let mut target = Shard::new(name, source.tenant_id.clone(), endpoint);
        // Targets start without vnodes; the cutover commit assigns them
        target.vnodes = Vec::new();
        Ok(target)
    }

    pub async fn split(&self, req: SplitRequest) -> ShardResult<ReshardJob> {
        let source = self.catalog.get_shard(&req.shard_id)?;
        if source.status != ShardStatus::Active {
            return Err(ShardError::Validation(format!(
                "shard '{}' is {} and cannot be split",
                source.id, source.status
            )));
        }
        if let Some(job) = self.catalog.active_job_for(&source.id).await? {
            return Err(ShardError::Validation(format!(
                "shard '{}' already has reshard job '{}' in progress",
                source.id, job.id
            )));
        }

        let specs: Vec<TargetSpec> = if req.targets.is_empty() {
            vec![TargetSpec::default(), TargetSpec::default()]
        } else if req.targets.len() >= 2 {
            req.targets
        } else {
            return Err(ShardError::Validation(
                "a split needs at least two targets".into(),
            ));
        };

        let mut targets = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let target = self.resolve_target(spec, &source, index + 1)?;
            self.probe(&target.primary).await?;
            targets.push(target);
        }

        let job = ReshardJob::new(
            JobType::Split,
            vec![source.id.clone()],
            targets.iter().map(|t| t.id.clone()).collect(),
        );

        let committed_job = job.clone();
        let committed_targets = targets.clone();
        let source_id = source.id.clone();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut source = snapshot
                    .shards
                    .get(&source_id)
                    .cloned()
                    .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", source_id)))?;
                if source.status != ShardStatus::Active {
                    return Err(ShardError::Validation(format!(
                        "shard '{}' is no longer active",
                        source_id
                    )));
                }
                source.status = ShardStatus::Migrating;
                source.touch();

                let mut ops = vec![CatalogOp::PutShard(source)];
                for target in &committed_targets {
                    ops.push(CatalogOp::PutShard(target.clone()));
                }
                ops.push(CatalogOp::PutJob(committed_job.clone()));
                Ok(ops)
            })
            .await?;

        info!(
            "split of {} into {:?} submitted as job {}",
            source.id, job.target_shards, job.id
        );
        self.spawn_job(&job.id);
        Ok(job)
    }

    pub async fn merge(&self, req: MergeRequest) -> ShardResult<ReshardJob> {
        if req.source_shards.len() < 2 {
            return Err(ShardError::Validation(
                "a merge needs at least two source shards".into(),
            ));
        }

        let mut sources = Vec::with_capacity(req.source_shards.len());
        for id in &req.source_shards {
            let shard = self.catalog.get_shard(id)?;
            if shard.status != ShardStatus::Active {
                return Err(ShardError::Validation(format!(
                    "shard '{}' is {} and cannot be merged",
                    shard.id, shard.status
                )));
            }
            if let Some(job) = self.catalog.active_job_for(id).await? {
                return Err(ShardError::Validation(format!(
                    "shard '{}' already has reshard job '{}' in progress",
                    id, job.id
                )));
            }
            sources.push(shard);
        }
        let tenant_id = &sources[0].tenant_id;
        if sources.iter().any(|s| &s.tenant_id != tenant_id) {
            return Err(ShardError::Validation(
                "merge sources must belong to one tenant".into(),
            ));
        }

        let spec = req.target.unwrap_or_default();
        let target = self.resolve_target(&spec, &sources[0], 0)?;
        self.probe(&target.primary).await?;

        let job = ReshardJob::new(
            JobType::Merge,
            sources.iter().map(|s| s.id.clone()).collect(),
            vec![target.id.clone()],
        );

        let committed_job = job.clone();
        let committed_target = target.clone();
        let source_ids: Vec<String> = sources.iter().map(|s| s.id.clone()).collect();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                let mut ops = Vec::new();
                for id in &source_ids {
                    let mut shard = snapshot
                        .shards
                        .get(id)
                        .cloned()
                        .ok_or_else(|| ShardError::NotFound(format!("shard '{}'", id)))?;
                    if shard.status != ShardStatus::Active {
                        return Err(ShardError::Validation(format!(
                            "shard '{}' is no longer active",
                            id
                        )));
                    }
                    shard.status = ShardStatus::Migrating;
                    shard.touch();
                    ops.push(CatalogOp::PutShard(shard));
                }
                ops.push(CatalogOp::PutShard(committed_target.clone()));
                ops.push(CatalogOp::PutJob(committed_job.clone()));
                Ok(ops)
            })
            .await?;

        info!(
            "merge of {:?} into {} submitted as job {}",
            job.source_shards, target.id, job.id
        );
        self.spawn_job(&job.id);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> ShardResult<ReshardJob> {
        self.catalog.get_job(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> ShardResult<Vec<ReshardJob>> {
        self.catalog.list_jobs(status).await
    }

    pub async fn create_app(&self, req: CreateAppRequest) -> ShardResult<ClientApp> {
        if req.name.is_empty() {
            return Err(ShardError::Validation("tenant name is required".into()));
        }
        let app = ClientApp::new(req.name.clone(), req.tier, req.key_prefix.clone());
        let committed = app.clone();
        self.catalog
            .commit_with_retry(self.config.retry_attempts, move |snapshot| {
                if snapshot.apps.values().any(|a| a.name == committed.name) {
                    return Err(ShardError::Validation(format!(
                        "tenant name '{}' already exists",
                        committed.name
                    )));
                }
                if let Some(prefix) = &committed.key_prefix {
                    if snapshot
                        .apps
                        .values()
                        .any(|a| a.key_prefix.as_deref() == Some(prefix.as_str()))
                    {
                        return Err(ShardError::Validation(format!(
                            "key prefix '{}' already registered",
                            prefix
                        )));
                    }
                }
                Ok(vec![CatalogOp::PutApp(committed.clone())])
            })
            .await?;
        Ok(app)
    }
}
