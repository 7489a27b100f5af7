//! Hot/cold shard classification against configured thresholds

use serde::{Deserialize, Serialize};

use super::monitor::ShardMetrics;
use crate::config::AutoscaleThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadClass {
    Hot,
    Cold,
    Normal,
}

/// A shard is hot when any metric exceeds its ceiling and cold when every
/// metric sits below its floor; everything else is normal.
#[derive(Debug, Clone)]
pub struct HotShardDetector {
    thresholds: AutoscaleThresholds,
}

impl HotShardDetector {
    pub fn new(thresholds: AutoscaleThresholds) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, metrics: &ShardMetrics) -> LoadClass {
        let t = &self.thresholds;
        let hot = metrics.query_rate > t.max_query_rate
            || metrics.cpu_usage > t.max_cpu_usage
            || metrics.memory_usage > t.max_memory_usage
            || metrics.storage_usage > t.max_storage_usage
            || metrics.connection_count > t.max_connections
            || metrics.avg_latency_ms > t.max_latency_ms;
        if hot {
            return LoadClass::Hot;
        }

        let cold = metrics.query_rate < t.min_query_rate
            && metrics.cpu_usage < t.min_cpu_usage
            && metrics.memory_usage < t.min_memory_usage
            && metrics.storage_usage < t.min_storage_usage
            && metrics.connection_count < t.min_connections
            && metrics.avg_latency_ms < t.min_latency_ms;
        if cold {
            LoadClass::Cold
        } else {
            LoadClass::Normal
        }
    }
}
