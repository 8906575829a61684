use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

use crate::discovery::types::NodeState;
use crate::error::ClusterError;
use crate::shard::map::ShardMapSnapshot;
use crate::shard::types::{NodeId, ShardId, TaskId, now_ms};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MigrationPhase {
    Planned,
    DataCopying,
    Cutover,
    Committed,
    Aborted,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Committed | MigrationPhase::Aborted)
    }

    /// Phases that count against the destination's admission limit.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, MigrationPhase::DataCopying | MigrationPhase::Cutover)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MigrationKind {
    /// Load balancing after a join or an explicit rebalance request.
    Rebalance,
    /// The source is gone; the destination starts the shard empty.
    Recovery,
    /// Draining a decommissioned node.
    Drain,
    /// Requested by an operator through `MoveShard`.
    Manual,
}

/// One shard move, owned by the Master from planning until it is archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTask {
    pub task_id: TaskId,
    pub shard: ShardId,
    pub source: NodeId,
    pub destination: NodeId,
    pub kind: MigrationKind,
    pub phase: MigrationPhase,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub snapshot_entries: Option<usize>,
    pub caught_up: bool,
    /// Participants that have not yet acknowledged a rollback. The shard stays
    /// locked until this is empty.
    pub pending_rollback: BTreeSet<NodeId>,
    pub rollback_failures: u32,
    pub reason: Option<String>,

    #[serde(skip)]
    pub catch_up_deadline: Option<Instant>,
}

impl MigrationTask {
    pub fn new(shard: ShardId, source: NodeId, destination: NodeId, kind: MigrationKind) -> Self {
        let now = now_ms();
        Self {
            task_id: TaskId::new(),
            shard,
            source,
            destination,
            kind,
            phase: MigrationPhase::Planned,
            created_at_ms: now,
            updated_at_ms: now,
            snapshot_entries: None,
            caught_up: false,
            pending_rollback: BTreeSet::new(),
            rollback_failures: 0,
            reason: None,
            catch_up_deadline: None,
        }
    }

    pub fn set_phase(&mut self, phase: MigrationPhase) {
        self.phase = phase;
        self.updated_at_ms = now_ms();
    }

    pub fn involves(&self, node: NodeId) -> bool {
        self.source == node || self.destination == node
    }

    /// Terminal and nothing left to roll back.
    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal() && self.pending_rollback.is_empty()
    }
}

/// Facts a source node reports while it streams a shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MigrationProgress {
    SnapshotInstalled { entries: usize },
    CaughtUp { lag: u64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub raised_at_ms: u64,
    pub error: ClusterError,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberView {
    pub node_id: NodeId,
    pub address: String,
    pub state: NodeState,
    pub incarnation: u64,
    pub shards: usize,
    pub draining: bool,
}

/// Operator view of the Master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterStatus {
    pub epoch: u64,
    pub map: ShardMapSnapshot,
    pub active: Vec<MigrationTask>,
    pub history: Vec<MigrationTask>,
    pub alerts: Vec<Alert>,
    pub members: Vec<MemberView>,
}
