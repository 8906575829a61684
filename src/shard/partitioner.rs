use super::types::ShardId;

/// Maps a key onto one of `shard_count` contiguous hash ranges.
///
/// The hash is CRC32 of the key bytes, so clients and nodes built from
/// different toolchains still agree on placement. With `shard_count <= 1`
/// every key lands in shard 0.
pub fn shard_for_key(key: &str, shard_count: u32) -> ShardId {
    if shard_count <= 1 {
        return 0;
    }
    let hash = crc32fast::hash(key.as_bytes()) as u64;
    ((hash * shard_count as u64) >> 32) as ShardId
}

/// Inclusive lower and exclusive upper bound of the hash range owned by `shard`.
pub fn shard_hash_range(shard: ShardId, shard_count: u32) -> (u64, u64) {
    let count = shard_count.max(1) as u64;
    let space = 1u64 << 32;
    let lower = (shard as u64 * space).div_ceil(count);
    let upper = ((shard as u64 + 1) * space).div_ceil(count);
    (lower, upper)
}
