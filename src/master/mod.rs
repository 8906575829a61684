//! Master Coordinator
//!
//! The only component that changes shard ownership. It watches Discovery,
//! plans moves, drives each move through its phases and commits the result as a
//! new map version. Nodes and clients only ever see committed versions.
//!
//! ## Core Mechanisms
//! - **Reconcile Loop**: Diffs the live set, aborts tasks that lost a participant,
//!   bootstraps the first map and re-plans when membership changed.
//! - **Planner**: A pure function from (map, members, busy shards) to moves. Departed
//!   nodes first, then the minimum moves to get every node within one shard of the others.
//! - **Migration Tasks**: `Planned → DataCopying → Cutover → Committed`, or `Aborted` from
//!   any non-terminal phase. A commit is one log append plus one map apply.
//! - **Commit Log**: Every map version is durably appended before it is published, and
//!   replayed on start.

pub mod coordinator;
pub mod handlers;
pub mod log;
pub mod planner;
pub mod protocol;
pub mod types;

pub use coordinator::Master;
pub use log::{FileMapLog, MapLog, MemoryMapLog};
pub use types::{MigrationKind, MigrationPhase, MigrationProgress, MigrationTask};

#[cfg(test)]
mod tests;
