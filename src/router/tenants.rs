//! In-memory tenant usage accounting
//!
//! Request counters, last-seen stamps, and observed shard sets accumulate
//! here on the hot path and are flushed to the catalog periodically. These
//! are tracking counters only; quota enforcement always reads the catalog.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::catalog::{Catalog, CatalogOp};
use crate::error::ShardResult;

#[derive(Debug, Clone, Default)]
struct TenantUsage {
    requests: u64,
    last_seen: Option<DateTime<Utc>>,
    shard_ids: HashSet<String>,
}

#[derive(Default)]
pub struct TenantTracker {
    usage: DashMap<String, TenantUsage>,
}

impl TenantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant_id: &str, shard_id: &str) {
        let mut entry = self.usage.entry(tenant_id.to_string()).or_default();
        entry.requests += 1;
        entry.last_seen = Some(Utc::now());
        entry.shard_ids.insert(shard_id.to_string());
    }

    pub fn request_count(&self, tenant_id: &str) -> u64 {
        self.usage.get(tenant_id).map(|u| u.requests).unwrap_or(0)
    }

    /// Merge accumulated usage into the catalog and reset local deltas.
    /// Tenants unknown to the catalog are skipped; usage is best-effort.
    pub async fn flush(&self, catalog: &Catalog, retry_attempts: u32) -> ShardResult<()> {
        let drained: Vec<(String, TenantUsage)> = self
            .usage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if drained.is_empty() {
            return Ok(());
        }

        for (tenant_id, usage) in &drained {
            if catalog.get_app(tenant_id).is_err() {
                continue;
            }
            let owned_id = tenant_id.clone();
            let usage = usage.clone();
            let result = catalog
                .commit_with_retry(retry_attempts, move |snapshot| {
                    let mut app = snapshot
                        .apps
                        .get(&owned_id)
                        .cloned()
                        .ok_or_else(|| {
                            crate::error::ShardError::NotFound(format!("client app '{}'", owned_id))
                        })?;
                    app.request_count += usage.requests;
                    if usage.last_seen.is_some() {
                        app.last_seen = usage.last_seen;
                    }
                    for shard_id in &usage.shard_ids {
                        if !app.shard_ids.contains(shard_id) {
                            app.shard_ids.push(shard_id.clone());
                        }
                    }
                    app.shard_ids.sort();
                    Ok(vec![CatalogOp::PutApp(app)])
                })
                .await;
            if result.is_ok() {
                self.usage.remove(tenant_id);
            } else {
                debug!("tenant usage flush for {} failed, keeping deltas", tenant_id);
            }
        }
        Ok(())
    }
}
