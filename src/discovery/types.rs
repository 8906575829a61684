use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::shard::types::NodeId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// `Suspect` nodes still count as present; only `Dead` ones are gone.
    pub fn is_live(&self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

/// A registered node as seen by Discovery.
///
/// `incarnation` increases every time the node comes back as a new process
/// (restart or rejoin after `Dead`), so observers can tell a bounce apart
/// from an uninterrupted membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub address: String,
    pub state: NodeState,
    pub incarnation: u64,
    /// Random per node process.
    pub boot_id: String,
    pub missed_deadlines: u32,

    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    #[serde(skip)]
    pub suspect_since: Option<Instant>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub incarnation: u64,
    /// The node had been declared `Dead`; whatever it still holds is stale.
    pub rejoined_after_dead: bool,
}

/// Liveness transitions, reported by registration, heartbeats and sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined { node_id: NodeId, incarnation: u64 },
    Restarted { node_id: NodeId, incarnation: u64 },
    Suspected(NodeId),
    Recovered(NodeId),
    Died(NodeId),
    Left(NodeId),
}
