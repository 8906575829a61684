//! Master Network Protocol
//!
//! Public map reads, progress reports from source nodes, and operator commands.

use serde::{Deserialize, Serialize};

use super::types::MigrationProgress;
use crate::shard::types::{NodeId, ShardId, TaskId};

// --- API Endpoints ---

/// Current committed `ShardMapSnapshot`.
pub const ENDPOINT_SHARD_MAP: &str = "/master/map";
/// Source node reports snapshot/catch-up/failure for a task.
pub const ENDPOINT_PROGRESS: &str = "/master/progress";
pub const ENDPOINT_STATUS: &str = "/master/status";
pub const ENDPOINT_MOVE_SHARD: &str = "/master/move";
pub const ENDPOINT_DECOMMISSION: &str = "/master/decommission";
pub const ENDPOINT_REBALANCE: &str = "/master/rebalance";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub task_id: TaskId,
    pub shard: ShardId,
    /// Node sending the report. Must be the task's source.
    pub reporter: NodeId,
    pub progress: MigrationProgress,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoveShardRequest {
    pub shard: ShardId,
    pub destination: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoveShardResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecommissionRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RebalanceResponse {
    /// Tasks planned or still running after the rebalance pass.
    pub tasks: Vec<TaskId>,
}
