//! Discovery Registry
//!
//! Tracks which storage nodes exist and whether they are alive. Discovery holds
//! no shard knowledge; the Master polls it and treats membership changes as the
//! only trigger for rebalancing.
//!
//! ## Core Mechanisms
//! - **Registration**: Nodes register with an id, an address and a per-process boot id.
//!   A restart or a rejoin after `Dead` bumps the node's incarnation.
//! - **Failure Detection**: `Alive → Suspect` after one missed heartbeat deadline,
//!   `Suspect → Dead` after repeated misses or a grace window, `Suspect → Alive` on a
//!   heartbeat in time.
//! - **Conflicts**: A live node id claimed from another address is rejected with
//!   `AlreadyRegistered`.

pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod types;

pub use registry::DiscoveryRegistry;
pub use types::{MembershipEvent, NodeRecord, NodeState, RegisterOutcome};
