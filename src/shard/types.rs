use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable shard identifier. Shards are numbered `0..shard_count`.
pub type ShardId = u32;

/// Cluster-wide shard map version. Strictly increases on every commit.
pub type MapVersion = u64;

/// Identity of a storage node as configured by the operator.
///
/// Ordered so that placement ties can be broken by lowest id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Unique identifier of a migration task.
///
/// Wrapper around a UUID string, like every other cluster-generated id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a node can be reached. The address is whatever the transport
/// understands (`host:port` for HTTP).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub node_id: NodeId,
    pub address: String,
}

impl NodeEndpoint {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
        }
    }
}

/// Ownership record of one shard at a committed map version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardAssignment {
    pub shard: ShardId,
    pub owner: NodeId,
    /// Map version at which `owner` was granted this shard.
    pub version: MapVersion,
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
