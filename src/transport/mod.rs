//! Role-to-role RPC seams.
//!
//! Roles only ever talk through these traits. `http` carries them over
//! axum/reqwest; `local` wires roles together in one process for tests and
//! embedding.

pub mod http;
pub mod local;

use async_trait::async_trait;

use crate::discovery::types::{NodeRecord, RegisterOutcome};
use crate::error::ClusterResult;
use crate::master::protocol::ProgressReport;
use crate::node::protocol::{
    AbortRequest, ActivateRequest, ApplyDeltaRequest, BeginTransferRequest, CutoverAck,
    CutoverRequest, InstallSnapshotRequest, PrepareReceiveRequest, ReleaseRequest,
};
use crate::node::types::NodeStatus;
use crate::shard::map::ShardMapSnapshot;
use crate::shard::types::{NodeEndpoint, NodeId};

#[async_trait]
pub trait DiscoveryApi: Send + Sync {
    async fn register(
        &self,
        node_id: NodeId,
        address: &str,
        boot_id: &str,
    ) -> ClusterResult<RegisterOutcome>;

    /// Returns the node's incarnation.
    async fn heartbeat(&self, node_id: NodeId) -> ClusterResult<u64>;

    async fn list_alive(&self) -> ClusterResult<Vec<NodeRecord>>;

    async fn deregister(&self, node_id: NodeId) -> ClusterResult<()>;
}

#[async_trait]
pub trait MasterApi: Send + Sync {
    async fn get_shard_map(&self) -> ClusterResult<ShardMapSnapshot>;

    async fn report_migration_progress(&self, report: ProgressReport) -> ClusterResult<()>;
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get(&self, node: &NodeEndpoint, key: &str) -> ClusterResult<Option<String>>;

    async fn put(&self, node: &NodeEndpoint, key: &str, value: &str) -> ClusterResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, node: &NodeEndpoint, key: &str) -> ClusterResult<bool>;

    async fn prepare_receive(
        &self,
        node: &NodeEndpoint,
        req: PrepareReceiveRequest,
    ) -> ClusterResult<()>;

    async fn begin_snapshot_transfer(
        &self,
        node: &NodeEndpoint,
        req: BeginTransferRequest,
    ) -> ClusterResult<()>;

    /// Returns the number of entries installed.
    async fn install_snapshot(
        &self,
        node: &NodeEndpoint,
        req: InstallSnapshotRequest,
    ) -> ClusterResult<usize>;

    /// Returns the destination's applied sequence after the batch.
    async fn apply_delta(&self, node: &NodeEndpoint, req: ApplyDeltaRequest)
    -> ClusterResult<u64>;

    async fn cutover(&self, node: &NodeEndpoint, req: CutoverRequest) -> ClusterResult<CutoverAck>;

    async fn activate(&self, node: &NodeEndpoint, req: ActivateRequest) -> ClusterResult<()>;

    async fn release(&self, node: &NodeEndpoint, req: ReleaseRequest) -> ClusterResult<()>;

    async fn abort_migration(&self, node: &NodeEndpoint, req: AbortRequest) -> ClusterResult<()>;

    async fn status(&self, node: &NodeEndpoint) -> ClusterResult<NodeStatus>;
}
