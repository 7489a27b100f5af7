//! Consistent-hash ring mapping shard keys to owning shards

pub mod hash;
pub mod ring;

pub use hash::{position, vnode_positions};
pub use ring::HashRing;
