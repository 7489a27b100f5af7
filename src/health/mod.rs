//! Shard health probing, registry, and failover

pub mod controller;
pub mod registry;

pub use controller::HealthController;
pub use registry::{FailoverEvent, HealthRegistry, HealthStatus, ShardHealth};
