use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::shard::types::{MapVersion, NodeEndpoint, NodeId, ShardId, TaskId};

/// Local lifecycle of one hosted shard.
///
/// Only `Stable` and `MigratingOut` serve client traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SlotState {
    Stable,
    /// Serving, while a snapshot and trailing writes stream to `destination`.
    MigratingOut {
        task_id: TaskId,
        destination: NodeEndpoint,
    },
    /// Receiving data; not serving. `source` is `None` for a recovery with no live source.
    MigratingIn {
        task_id: TaskId,
        source: Option<NodeId>,
        applied_seq: u64,
    },
    /// Handed off at cutover. Data is kept until the Master confirms the commit.
    Retired {
        task_id: TaskId,
        destination: NodeEndpoint,
    },
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Stable => "Stable",
            SlotState::MigratingOut { .. } => "MigratingOut",
            SlotState::MigratingIn { .. } => "MigratingIn",
            SlotState::Retired { .. } => "Retired",
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, SlotState::Stable | SlotState::MigratingOut { .. })
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            SlotState::Stable => None,
            SlotState::MigratingOut { task_id, .. }
            | SlotState::MigratingIn { task_id, .. }
            | SlotState::Retired { task_id, .. } => Some(task_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mutation {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

/// A write captured while the shard was `MigratingOut`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaOp {
    /// Starts at 1 for every migration and increases by one per write.
    pub seq: u64,
    pub mutation: Mutation,
}

/// Writes not yet acknowledged by the destination.
#[derive(Debug, Default)]
pub struct DeltaLog {
    pub ops: VecDeque<DeltaOp>,
    pub next_seq: u64,
}

impl DeltaLog {
    pub fn reset(&mut self) {
        self.ops.clear();
        self.next_seq = 1;
    }

    pub fn push(&mut self, mutation: Mutation) -> u64 {
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push_back(DeltaOp { seq, mutation });
        seq
    }

    pub fn pending(&self, limit: usize) -> Vec<DeltaOp> {
        self.ops.iter().take(limit).cloned().collect()
    }

    /// Drops every op up to and including `seq`.
    pub fn ack(&mut self, seq: u64) {
        while self.ops.front().is_some_and(|op| op.seq <= seq) {
            self.ops.pop_front();
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardStatus {
    pub shard: ShardId,
    pub state: String,
    pub task_id: Option<TaskId>,
    pub entries: usize,
    pub pending_delta: usize,
    pub owner_version: MapVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub address: String,
    pub known_version: MapVersion,
    pub shard_count: u32,
    pub master_epoch: u64,
    pub shards: Vec<ShardStatus>,
}
