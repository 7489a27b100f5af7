//! Pooled database connectivity for shard endpoints

pub mod connector;
pub mod pool;

pub use connector::{is_read_statement, Connection, Connector, PgConnector, QueryOutput};
pub use pool::{ConnectionPool, PoolLease};
