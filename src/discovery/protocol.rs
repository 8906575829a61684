//! Discovery Network Protocol
//!
//! Endpoints and DTOs for node registration and liveness. Every reply is
//! wrapped in `ApiResponse`.

use serde::{Deserialize, Serialize};

use crate::shard::types::NodeId;

// --- API Endpoints ---

/// Node announces itself (first start, restart, or rejoin after `Dead`).
pub const ENDPOINT_REGISTER: &str = "/discovery/register";
/// Periodic liveness signal.
pub const ENDPOINT_HEARTBEAT: &str = "/discovery/heartbeat";
/// Every node not declared `Dead`.
pub const ENDPOINT_ALIVE: &str = "/discovery/alive";
/// Permanent removal (used after a decommission).
pub const ENDPOINT_DEREGISTER: &str = "/discovery/deregister";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: NodeId,
    /// Address the node serves data and migration RPCs on.
    pub address: String,
    /// Random per process. A new value with the same address means a restart.
    pub boot_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub incarnation: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub node_id: NodeId,
}
