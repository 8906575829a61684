use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{ClusterError, ClusterResult};
use crate::shard::types::ShardId;

/// In-memory store holding the data of every shard hosted by one node.
///
/// Shards are independent maps; nothing here knows about ownership or
/// migration. The node agent decides which shard a request may touch.
#[derive(Clone, Default)]
pub struct ShardStore {
    shards: Arc<DashMap<ShardId, DashMap<String, String>>>,
}

impl ShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty shard. Existing data is left alone.
    pub fn create_shard(&self, shard: ShardId) {
        self.shards.entry(shard).or_default();
    }

    /// Removes a shard and everything in it. Returns the number of entries dropped.
    pub fn drop_shard(&self, shard: ShardId) -> usize {
        self.shards
            .remove(&shard)
            .map(|(_, data)| data.len())
            .unwrap_or(0)
    }

    pub fn has_shard(&self, shard: ShardId) -> bool {
        self.shards.contains_key(&shard)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, shard: ShardId, key: &str) -> ClusterResult<Option<String>> {
        let data = self.shard(shard)?;
        Ok(data.get(key).map(|v| v.value().clone()))
    }

    /// Returns the previous value.
    pub fn put(&self, shard: ShardId, key: String, value: String) -> ClusterResult<Option<String>> {
        let data = self.shard(shard)?;
        Ok(data.insert(key, value))
    }

    /// Returns the removed value.
    pub fn delete(&self, shard: ShardId, key: &str) -> ClusterResult<Option<String>> {
        let data = self.shard(shard)?;
        Ok(data.remove(key).map(|(_, v)| v))
    }

    /// Copy of every entry in the shard, sorted by key.
    pub fn scan(&self, shard: ShardId) -> ClusterResult<Vec<(String, String)>> {
        let data = self.shard(shard)?;
        let mut entries: Vec<(String, String)> = data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub fn entry_count(&self, shard: ShardId) -> usize {
        self.shards.get(&shard).map(|data| data.len()).unwrap_or(0)
    }

    /// Bulk insert used while installing a snapshot.
    pub fn put_all(&self, shard: ShardId, entries: Vec<(String, String)>) -> ClusterResult<usize> {
        let data = self.shard(shard)?;
        let count = entries.len();
        for (key, value) in entries {
            data.insert(key, value);
        }
        Ok(count)
    }

    /// Drops every shard.
    pub fn clear(&self) -> usize {
        let count = self.shards.len();
        self.shards.clear();
        count
    }

    fn shard(
        &self,
        shard: ShardId,
    ) -> ClusterResult<dashmap::mapref::one::Ref<'_, ShardId, DashMap<String, String>>> {
        self.shards
            .get(&shard)
            .ok_or_else(|| ClusterError::Storage(format!("shard {} is not hosted here", shard)))
    }
}
