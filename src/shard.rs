//! Shard resolution and the per-session shard map
//!
//! A key belongs to shard `md5(key) mod shard_count`, with the 128-bit digest
//! read as an unsigned big-endian integer. The mapping has no salt, so every
//! process places a key on the same shard.

use md5::{Digest, Md5};
use std::fmt;

/// Identifier of a shard, `0..shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// 128-bit placement digest of a key.
///
/// An all-zero digest has its lowest bit forced to 1 so it never aliases the
/// zero sentinel.
pub fn key_digest(key: &str) -> u128 {
    let digest = Md5::digest(key.as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest);
    let value = u128::from_be_bytes(raw);
    if value == 0 {
        1
    } else {
        value
    }
}

/// Resolve `key` to a shard index, or `-1` when there are no shards.
pub fn resolve(key: &str, shard_count: i32) -> i32 {
    if shard_count <= 0 {
        return -1;
    }
    // shard_count is positive, so the remainder fits in i32
    (key_digest(key) % shard_count as u128) as i32
}

/// Shard id → node address, in discovery order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardMap {
    addresses: Vec<String>,
}

impl ShardMap {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn address(&self, shard: ShardId) -> Option<&str> {
        self.addresses.get(shard.0 as usize).map(String::as_str)
    }

    pub fn shard_for(&self, key: &str) -> Option<ShardId> {
        let count = i32::try_from(self.addresses.len()).unwrap_or(i32::MAX);
        match resolve(key, count) {
            -1 => None,
            idx => Some(ShardId(idx as u32)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShardId, &str)> {
        self.addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| (ShardId(i as u32), addr.as_str()))
    }
}
