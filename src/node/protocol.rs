//! Node Network Protocol
//!
//! Two planes share one listener:
//! - **Data plane**: `Get`/`Put`/`Delete` from clients. Any of them may fail with
//!   `NotOwner { current_version }`.
//! - **Migration plane**: called by the Master (prepare, begin, cutover, activate,
//!   release, abort) or by the source node (snapshot chunks and deltas).

use serde::{Deserialize, Serialize};

use super::types::DeltaOp;
use crate::shard::types::{MapVersion, NodeEndpoint, NodeId, ShardId, TaskId};

// --- API Endpoints ---

pub const ENDPOINT_GET: &str = "/kv/get";
pub const ENDPOINT_PUT: &str = "/kv/put";
pub const ENDPOINT_DELETE: &str = "/kv/delete";

/// Destination: absent → `MigratingIn`.
pub const ENDPOINT_PREPARE_RECEIVE: &str = "/migration/prepare";
/// Source: `Stable → MigratingOut`, starts streaming.
pub const ENDPOINT_BEGIN_TRANSFER: &str = "/migration/begin";
/// Source → destination snapshot chunk.
pub const ENDPOINT_INSTALL_SNAPSHOT: &str = "/migration/snapshot";
/// Source → destination trailing writes.
pub const ENDPOINT_APPLY_DELTA: &str = "/migration/delta";
/// Source: `MigratingOut → Retired`, flushes the remaining delta.
pub const ENDPOINT_CUTOVER: &str = "/migration/cutover";
/// Destination: `MigratingIn → Stable` once the Master committed.
pub const ENDPOINT_ACTIVATE: &str = "/migration/activate";
/// Source: drop the retired copy after the commit.
pub const ENDPOINT_RELEASE: &str = "/migration/release";
pub const ENDPOINT_ABORT: &str = "/migration/abort";

pub const ENDPOINT_STATUS: &str = "/node/status";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    /// `None` when the key does not exist in an owned shard.
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareReceiveRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
    /// `None` when the previous owner is gone and the shard restarts empty.
    pub source: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginTransferRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
    pub destination: NodeEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
    pub entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyDeltaRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
    /// Ascending by `seq`. Ops at or below the destination's applied sequence are skipped.
    pub ops: Vec<DeltaOp>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyDeltaResponse {
    pub applied_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoverRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CutoverAck {
    /// Highest delta sequence delivered to the destination.
    pub final_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRequest {
    /// `None` for a bootstrap grant of an empty shard.
    pub task_id: Option<TaskId>,
    pub shard: ShardId,
    pub version: MapVersion,
    pub shard_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
    pub version: MapVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub task_id: TaskId,
    pub shard: ShardId,
}
