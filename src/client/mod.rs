//! Routing Client
//!
//! Maps keys to shards and shards to owners with a cached copy of the shard
//! map. A `NotOwner` reply means the cache is stale: refresh, retry, and give
//! up with `RetriesExhausted` once the attempt budget is spent.

pub mod router;

pub use router::{ClientRouter, ClientStats};

#[cfg(test)]
mod tests;
