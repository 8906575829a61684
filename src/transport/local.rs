//! In-process transport.
//!
//! Every role lives in one process and calls are plain method calls. A node can
//! be isolated to simulate a partition: calls to it and calls it makes fail with
//! `Transport` until it is healed. Single calls can be blocked the same way:
//! `activate` to a node, or `progress` reports from it.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, PoisonError, RwLock};

use super::{DiscoveryApi, MasterApi, NodeApi};
use crate::config::NodeConfig;
use crate::discovery::registry::DiscoveryRegistry;
use crate::discovery::types::{NodeRecord, RegisterOutcome};
use crate::error::{ClusterError, ClusterResult};
use crate::master::coordinator::Master;
use crate::master::protocol::ProgressReport;
use crate::node::agent::NodeAgent;
use crate::node::protocol::{
    AbortRequest, ActivateRequest, ApplyDeltaRequest, BeginTransferRequest, CutoverAck,
    CutoverRequest, InstallSnapshotRequest, PrepareReceiveRequest, ReleaseRequest,
};
use crate::node::types::NodeStatus;
use crate::shard::map::ShardMapSnapshot;
use crate::shard::types::{NodeEndpoint, NodeId};

pub struct LocalCluster {
    registry: Arc<DiscoveryRegistry>,
    master: RwLock<Option<Arc<Master>>>,
    agents: DashMap<String, Arc<NodeAgent>>,
    isolated: DashSet<NodeId>,
    blocked: DashSet<(NodeId, &'static str)>,
}

impl LocalCluster {
    pub fn new(registry: Arc<DiscoveryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            master: RwLock::new(None),
            agents: DashMap::new(),
            isolated: DashSet::new(),
            blocked: DashSet::new(),
        })
    }

    /// Handle used by one participant. `caller` is `None` for the Master and clients.
    pub fn link(self: &Arc<Self>, caller: Option<NodeId>) -> Arc<LocalLink> {
        Arc::new(LocalLink {
            cluster: self.clone(),
            caller,
        })
    }

    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    pub fn set_master(&self, master: Arc<Master>) {
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(master);
    }

    pub fn master(&self) -> Option<Arc<Master>> {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds an agent wired to this cluster and makes it reachable at `address`.
    /// The agent still has to register itself.
    pub fn new_node(
        self: &Arc<Self>,
        node_id: NodeId,
        address: impl Into<String>,
        config: NodeConfig,
    ) -> Arc<NodeAgent> {
        let link = self.link(Some(node_id));
        let agent = NodeAgent::new(node_id, address, config, link.clone(), link.clone(), link);
        self.add_node(agent.clone());
        agent
    }

    pub fn add_node(&self, agent: Arc<NodeAgent>) {
        self.agents.insert(agent.endpoint().address.clone(), agent);
    }

    /// Replaces whatever agent served the same address.
    pub fn replace_node(&self, agent: Arc<NodeAgent>) {
        self.add_node(agent);
    }

    pub fn agent(&self, node_id: NodeId) -> Option<Arc<NodeAgent>> {
        self.agents
            .iter()
            .find(|entry| entry.value().node_id() == node_id)
            .map(|entry| entry.value().clone())
    }

    pub fn isolate(&self, node_id: NodeId) {
        tracing::info!(node_id = node_id.0, "Isolating node");
        self.isolated.insert(node_id);
    }

    pub fn heal(&self, node_id: NodeId) {
        tracing::info!(node_id = node_id.0, "Healing node");
        self.isolated.remove(&node_id);
    }

    /// Fails every `call` involving `node_id` until it is unblocked.
    pub fn block(&self, node_id: NodeId, call: &'static str) {
        tracing::info!(node_id = node_id.0, call, "Blocking call");
        self.blocked.insert((node_id, call));
    }

    pub fn unblock(&self, node_id: NodeId, call: &'static str) {
        self.blocked.remove(&(node_id, call));
    }

    fn check_blocked(&self, node_id: NodeId, call: &'static str) -> ClusterResult<()> {
        if self.blocked.contains(&(node_id, call)) {
            return Err(ClusterError::Transport(format!(
                "{} to {} was dropped",
                call, node_id
            )));
        }
        Ok(())
    }

    fn is_isolated(&self, node_id: NodeId) -> bool {
        self.isolated.contains(&node_id)
    }
}

pub struct LocalLink {
    cluster: Arc<LocalCluster>,
    caller: Option<NodeId>,
}

impl LocalLink {
    fn check_caller(&self) -> ClusterResult<()> {
        match self.caller {
            Some(node_id) if self.cluster.is_isolated(node_id) => Err(ClusterError::Transport(
                format!("{} is partitioned from the cluster", node_id),
            )),
            _ => Ok(()),
        }
    }

    fn target(&self, node: &NodeEndpoint) -> ClusterResult<Arc<NodeAgent>> {
        self.check_caller()?;
        if self.cluster.is_isolated(node.node_id) {
            return Err(ClusterError::Transport(format!(
                "{} is unreachable",
                node.node_id
            )));
        }
        self.cluster
            .agents
            .get(&node.address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::Transport(format!("connection refused: {}", node.address)))
    }

    fn master(&self) -> ClusterResult<Arc<Master>> {
        self.check_caller()?;
        self.cluster
            .master()
            .ok_or_else(|| ClusterError::Transport("master is not running".to_string()))
    }
}

#[async_trait]
impl DiscoveryApi for LocalLink {
    async fn register(
        &self,
        node_id: NodeId,
        address: &str,
        boot_id: &str,
    ) -> ClusterResult<RegisterOutcome> {
        self.check_caller()?;
        self.cluster.registry.register(node_id, address, boot_id)
    }

    async fn heartbeat(&self, node_id: NodeId) -> ClusterResult<u64> {
        self.check_caller()?;
        self.cluster.registry.heartbeat(node_id)
    }

    async fn list_alive(&self) -> ClusterResult<Vec<NodeRecord>> {
        self.check_caller()?;
        Ok(self.cluster.registry.list_alive())
    }

    async fn deregister(&self, node_id: NodeId) -> ClusterResult<()> {
        self.check_caller()?;
        self.cluster.registry.deregister(node_id)
    }
}

#[async_trait]
impl MasterApi for LocalLink {
    async fn get_shard_map(&self) -> ClusterResult<ShardMapSnapshot> {
        Ok(self.master()?.get_shard_map().as_ref().clone())
    }

    async fn report_migration_progress(&self, report: ProgressReport) -> ClusterResult<()> {
        let master = self.master()?;
        if let Some(caller) = self.caller {
            self.cluster.check_blocked(caller, "progress")?;
        }
        master.report_migration_progress(report).await
    }
}

#[async_trait]
impl NodeApi for LocalLink {
    async fn get(&self, node: &NodeEndpoint, key: &str) -> ClusterResult<Option<String>> {
        self.target(node)?.get(key)
    }

    async fn put(&self, node: &NodeEndpoint, key: &str, value: &str) -> ClusterResult<()> {
        self.target(node)?.put(key, value)
    }

    async fn delete(&self, node: &NodeEndpoint, key: &str) -> ClusterResult<bool> {
        self.target(node)?.delete(key)
    }

    async fn prepare_receive(
        &self,
        node: &NodeEndpoint,
        req: PrepareReceiveRequest,
    ) -> ClusterResult<()> {
        self.target(node)?.prepare_receive(req)
    }

    async fn begin_snapshot_transfer(
        &self,
        node: &NodeEndpoint,
        req: BeginTransferRequest,
    ) -> ClusterResult<()> {
        self.target(node)?.begin_snapshot_transfer(req)
    }

    async fn install_snapshot(
        &self,
        node: &NodeEndpoint,
        req: InstallSnapshotRequest,
    ) -> ClusterResult<usize> {
        self.target(node)?.install_snapshot(req)
    }

    async fn apply_delta(
        &self,
        node: &NodeEndpoint,
        req: ApplyDeltaRequest,
    ) -> ClusterResult<u64> {
        self.target(node)?.apply_delta(req)
    }

    async fn cutover(&self, node: &NodeEndpoint, req: CutoverRequest) -> ClusterResult<CutoverAck> {
        self.target(node)?.cutover(req).await
    }

    async fn activate(&self, node: &NodeEndpoint, req: ActivateRequest) -> ClusterResult<()> {
        let target = self.target(node)?;
        self.cluster.check_blocked(node.node_id, "activate")?;
        target.activate(req)
    }

    async fn release(&self, node: &NodeEndpoint, req: ReleaseRequest) -> ClusterResult<()> {
        self.target(node)?.release(req)
    }

    async fn abort_migration(&self, node: &NodeEndpoint, req: AbortRequest) -> ClusterResult<()> {
        self.target(node)?.abort_migration(req)
    }

    async fn status(&self, node: &NodeEndpoint) -> ClusterResult<NodeStatus> {
        Ok(self.target(node)?.status())
    }
}
