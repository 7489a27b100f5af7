pub mod autoscale;
pub mod catalog;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod reshard;
pub mod ring;
pub mod router;
pub mod server;

pub use catalog::{Catalog, MemoryCatalogStore, RocksCatalogStore};
pub use config::Config;
pub use error::{ShardError, ShardResult};
pub use router::{Consistency, QueryResponse};
pub use server::{create_router, AppState};
