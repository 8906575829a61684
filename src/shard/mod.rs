//! Shard Model
//!
//! Shared vocabulary of every role: how keys map to shards and how shards map
//! to owning nodes.
//!
//! ## Core Concepts
//! - **Partitioning**: The keyspace is split into `shard_count` contiguous CRC32
//!   hash ranges. The count is fixed for the life of a cluster.
//! - **ShardMap**: Owned by the Master. Changes only through `MapRecord`s, each
//!   carrying exactly the next version.
//! - **Snapshots**: Everyone else sees a `ShardMapSnapshot`, a versioned copy that
//!   may be stale and is treated as a routing hint.

pub mod map;
pub mod partitioner;
pub mod types;

pub use map::{MapRecord, ShardMap, ShardMapSnapshot};
pub use partitioner::shard_for_key;
pub use types::{MapVersion, NodeEndpoint, NodeId, ShardAssignment, ShardId, TaskId};

#[cfg(test)]
mod tests;
