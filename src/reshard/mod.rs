//! Online resharding: staged split/merge with zero-downtime cutover

pub mod executor;
pub mod mover;

pub use executor::Resharder;
pub use mover::{DataMover, MemoryDataMover, MovedRow, RangeDigest, SqlDataMover};
