//! Storage Node
//!
//! Hosts shards, answers data requests for the shards it owns and plays either
//! side of a migration. A node never decides ownership: it follows the map
//! versions the Master publishes.
//!
//! ## Core Concepts
//! - **Shard Slots**: Each hosted shard is `Stable`, `MigratingOut`, `MigratingIn` or
//!   `Retired`. Only `Stable` and `MigratingOut` serve traffic; everything else answers
//!   `NotOwner` with the newest version the node knows.
//! - **Snapshot + Delta**: The source snapshots the shard under the slot's write lock and
//!   records every later write in a sequenced delta log, streamed until cutover.
//! - **Map Following**: Periodic map sync repairs missed activations and releases, drops
//!   copies granted elsewhere, and rolls back migrations a restarted Master never committed.

pub mod agent;
pub mod handlers;
pub mod protocol;
pub mod types;

pub use agent::NodeAgent;
pub use types::{NodeStatus, ShardStatus, SlotState};

#[cfg(test)]
mod tests;
