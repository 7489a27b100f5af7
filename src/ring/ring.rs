//! Immutable ring snapshot with successor lookup

use std::collections::BTreeMap;

use super::hash::position;

/// An immutable view of vnode ownership at one catalog version.
///
/// Readers hold a snapshot and never see partial updates; the ring is rebuilt
/// from scratch whenever the catalog version changes.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// vnode position -> owning shard id
    entries: BTreeMap<u64, String>,
    /// Catalog version this ring was built from.
    version: i64,
}

impl HashRing {
    /// Build a ring from `(shard_id, vnode positions)` pairs.
    ///
    /// When two shards derive the same position the lexicographically
    /// smallest shard id wins; this keeps ties deterministic across nodes.
    pub fn build<'a, I>(version: i64, shards: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u64])>,
    {
        let mut entries: BTreeMap<u64, String> = BTreeMap::new();
        for (shard_id, vnodes) in shards {
            for pos in vnodes {
                match entries.get(pos) {
                    Some(existing) if existing.as_str() <= shard_id => {}
                    _ => {
                        entries.insert(*pos, shard_id.to_string());
                    }
                }
            }
        }
        Self { entries, version }
    }

    pub fn empty(version: i64) -> Self {
        Self {
            entries: BTreeMap::new(),
            version,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn vnode_count(&self) -> usize {
        self.entries.len()
    }

    /// The shard owning `key`: the one whose vnode position is the smallest
    /// value >= hash(key), wrapping around at 2^64.
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owner_of_position(position(key))
    }

    /// Successor lookup for an already-hashed position.
    pub fn owner_of_position(&self, pos: u64) -> Option<&str> {
        self.entries
            .range(pos..)
            .next()
            .or_else(|| self.entries.iter().next())
            .map(|(_, shard_id)| shard_id.as_str())
    }

    /// The vnode position that owns `pos` (the successor), if any.
    pub fn successor_position(&self, pos: u64) -> Option<u64> {
        self.entries
            .range(pos..)
            .next()
            .or_else(|| self.entries.iter().next())
            .map(|(p, _)| *p)
    }

    /// Distinct shard ids present on the ring.
    pub fn shard_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.values().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
