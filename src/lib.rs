//! Sharded Key-Value Cluster Library
//!
//! Keys hash into a fixed number of shards; a single Master decides which node
//! owns each shard and publishes that decision as a versioned shard map. The
//! binary (`main.rs`) runs any one role per process.
//!
//! ## Architecture Modules
//! - **`shard`**: Shared data model. Ids, key hashing, the shard map and its snapshots.
//! - **`storage`**: Per-shard in-memory key-value store used by nodes.
//! - **`discovery`**: Node registration, heartbeats and failure detection.
//! - **`master`**: Shard map owner. Plans, drives and commits migrations.
//! - **`node`**: Storage node. Data plane plus both sides of a migration.
//! - **`client`**: Key router with a cached map and bounded redirect handling.
//! - **`transport`**: Role-to-role traits with HTTP and in-process implementations.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod master;
pub mod node;
pub mod shard;
pub mod storage;
pub mod transport;
