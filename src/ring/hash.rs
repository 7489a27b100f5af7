//! Key hashing for ring positions

use std::io::Cursor;

/// Seed for all ring hashing. Frozen: changing it would remap every key in
/// every production catalog.
const RING_SEED: u32 = 0;

/// Map a key to its position on the 64-bit ring.
///
/// MurmurHash3 x64-128 truncated to the low 64 bits. The hash choice is part
/// of the wire contract and must not change once a catalog exists.
pub fn position(key: &str) -> u64 {
    let mut cursor = Cursor::new(key.as_bytes());
    // Hashing an in-memory buffer cannot fail
    murmur3::murmur3_x64_128(&mut cursor, RING_SEED)
        .map(|h| h as u64)
        .unwrap_or(0)
}

/// Derive the vnode positions owned by a shard.
///
/// Positions are a pure function of the shard id and index, so any node can
/// recompute them without coordination.
pub fn vnode_positions(shard_id: &str, count: u32) -> Vec<u64> {
    (0..count)
        .map(|i| position(&format!("{}-vnode-{}", shard_id, i)))
        .collect()
}
