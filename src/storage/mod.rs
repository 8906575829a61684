//! Local Shard Store
//!
//! Opaque per-shard key-value storage owned by a single node.
//!
//! ## Core Concepts
//! - **Isolation**: Each shard is its own map. Creating or dropping one never touches another.
//! - **No routing**: The store serves whatever shard it is asked for; ownership checks
//!   live in the node agent.
//! - **Scan**: Ordered copy of a shard, used as the migration snapshot.

pub mod memory;

pub use memory::ShardStore;
