use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::partitioner::shard_for_key;
use super::types::{MapVersion, NodeEndpoint, NodeId, ShardAssignment, ShardId, TaskId};
use crate::error::{ClusterError, ClusterResult};

/// One committed change to the shard map.
///
/// Records are produced before the map changes, appended to the commit log,
/// and only then applied. Replaying the log in order rebuilds the map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MapRecord {
    Bootstrap {
        version: MapVersion,
        shard_count: u32,
        assignments: Vec<ShardAssignment>,
    },
    Move {
        version: MapVersion,
        task_id: TaskId,
        shard: ShardId,
        from: NodeId,
        to: NodeId,
    },
}

impl MapRecord {
    pub fn version(&self) -> MapVersion {
        match self {
            MapRecord::Bootstrap { version, .. } | MapRecord::Move { version, .. } => *version,
        }
    }
}

/// The authoritative shard map. Only the Master holds a mutable one.
#[derive(Debug, Clone)]
pub struct ShardMap {
    version: MapVersion,
    shard_count: u32,
    assignments: BTreeMap<ShardId, ShardAssignment>,
}

impl ShardMap {
    pub fn new(shard_count: u32) -> Self {
        Self {
            version: 0,
            shard_count: shard_count.max(1),
            assignments: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> MapVersion {
        self.version
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.version > 0
    }

    pub fn owner(&self, shard: ShardId) -> Option<NodeId> {
        self.assignments.get(&shard).map(|a| a.owner)
    }

    pub fn assignment(&self, shard: ShardId) -> Option<&ShardAssignment> {
        self.assignments.get(&shard)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &ShardAssignment> {
        self.assignments.values()
    }

    pub fn shards_of(&self, node: NodeId) -> Vec<ShardId> {
        self.assignments
            .values()
            .filter(|a| a.owner == node)
            .map(|a| a.shard)
            .collect()
    }

    /// Shard count per owner. Nodes owning nothing are absent.
    pub fn load(&self) -> BTreeMap<NodeId, usize> {
        let mut load = BTreeMap::new();
        for a in self.assignments.values() {
            *load.entry(a.owner).or_insert(0) += 1;
        }
        load
    }

    /// Round-robin over the sorted node ids, committed as version 1.
    pub fn bootstrap_record(&self, nodes: &[NodeId]) -> ClusterResult<MapRecord> {
        if self.is_bootstrapped() {
            return Err(ClusterError::Storage(format!(
                "shard map already bootstrapped at version {}",
                self.version
            )));
        }
        if nodes.is_empty() {
            return Err(ClusterError::Storage(
                "cannot bootstrap a shard map without nodes".to_string(),
            ));
        }

        let mut sorted = nodes.to_vec();
        sorted.sort();
        sorted.dedup();

        let version = 1;
        let assignments = (0..self.shard_count)
            .map(|shard| ShardAssignment {
                shard,
                owner: sorted[shard as usize % sorted.len()],
                version,
            })
            .collect();

        Ok(MapRecord::Bootstrap {
            version,
            shard_count: self.shard_count,
            assignments,
        })
    }

    /// Builds the record that hands `shard` from `from` to `to` at the next version.
    pub fn move_record(
        &self,
        task_id: &TaskId,
        shard: ShardId,
        from: NodeId,
        to: NodeId,
    ) -> ClusterResult<MapRecord> {
        match self.owner(shard) {
            Some(owner) if owner == from => Ok(MapRecord::Move {
                version: self.version + 1,
                task_id: task_id.clone(),
                shard,
                from,
                to,
            }),
            Some(owner) => Err(ClusterError::InvalidShardState {
                shard,
                state: format!("owned by {}", owner),
                operation: format!("move from {}", from),
            }),
            None => Err(ClusterError::NoShardMap),
        }
    }

    /// Applies a record produced by this map (or replayed from the log).
    ///
    /// Every record must carry exactly the next version; the old owner's right
    /// is revoked in the same step that grants the new owner's.
    pub fn apply(&mut self, record: &MapRecord) -> ClusterResult<()> {
        if record.version() != self.version + 1 {
            return Err(ClusterError::Storage(format!(
                "record version {} does not follow map version {}",
                record.version(),
                self.version
            )));
        }

        match record {
            MapRecord::Bootstrap {
                version,
                shard_count,
                assignments,
            } => {
                self.shard_count = *shard_count;
                self.assignments = assignments.iter().map(|a| (a.shard, a.clone())).collect();
                self.version = *version;
            }
            MapRecord::Move {
                version,
                shard,
                from,
                to,
                ..
            } => {
                let entry = self
                    .assignments
                    .get_mut(shard)
                    .ok_or(ClusterError::NoShardMap)?;
                if entry.owner != *from {
                    return Err(ClusterError::InvalidShardState {
                        shard: *shard,
                        state: format!("owned by {}", entry.owner),
                        operation: format!("move from {}", from),
                    });
                }
                entry.owner = *to;
                entry.version = *version;
                self.version = *version;
            }
        }

        Ok(())
    }

    pub fn snapshot(&self, nodes: Vec<NodeEndpoint>, master_epoch: u64) -> ShardMapSnapshot {
        ShardMapSnapshot {
            version: self.version,
            shard_count: self.shard_count,
            master_epoch,
            assignments: self.assignments.values().cloned().collect(),
            nodes,
        }
    }
}

/// Read-only, versioned copy of the map handed to Nodes and Clients.
///
/// Carries the addresses of every owner so a client can route without a
/// separate Discovery lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardMapSnapshot {
    pub version: MapVersion,
    pub shard_count: u32,
    /// Random per Master process. A change means the Master restarted.
    pub master_epoch: u64,
    /// Sorted by shard id.
    pub assignments: Vec<ShardAssignment>,
    pub nodes: Vec<NodeEndpoint>,
}

impl ShardMapSnapshot {
    pub fn empty(shard_count: u32, master_epoch: u64) -> Self {
        Self {
            version: 0,
            shard_count,
            master_epoch,
            assignments: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn shard_for_key(&self, key: &str) -> ShardId {
        shard_for_key(key, self.shard_count)
    }

    pub fn assignment(&self, shard: ShardId) -> Option<&ShardAssignment> {
        self.assignments
            .binary_search_by_key(&shard, |a| a.shard)
            .ok()
            .map(|idx| &self.assignments[idx])
    }

    pub fn owner(&self, shard: ShardId) -> Option<NodeId> {
        self.assignment(shard).map(|a| a.owner)
    }

    pub fn endpoint(&self, node: NodeId) -> Option<&NodeEndpoint> {
        self.nodes.iter().find(|n| n.node_id == node)
    }

    pub fn shards_of(&self, node: NodeId) -> Vec<ShardId> {
        self.assignments
            .iter()
            .filter(|a| a.owner == node)
            .map(|a| a.shard)
            .collect()
    }

    /// Resolves a key to its shard and the endpoint of the shard's owner.
    pub fn route(&self, key: &str) -> ClusterResult<(ShardId, NodeEndpoint)> {
        if self.version == 0 {
            return Err(ClusterError::NoShardMap);
        }
        let shard = self.shard_for_key(key);
        let owner = self.owner(shard).ok_or(ClusterError::NoShardMap)?;
        let endpoint = self
            .endpoint(owner)
            .cloned()
            .ok_or(ClusterError::UnknownNode(owner))?;
        Ok((shard, endpoint))
    }
}
