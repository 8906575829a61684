use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::log::MapLog;
use super::planner::{PlanInput, plan};
use super::protocol::ProgressReport;
use super::types::{
    Alert, MasterStatus, MemberView, MigrationKind, MigrationPhase, MigrationProgress,
    MigrationTask,
};
use crate::config::MasterConfig;
use crate::discovery::types::{NodeRecord, NodeState};
use crate::error::{ClusterError, ClusterResult};
use crate::node::protocol::{
    AbortRequest, ActivateRequest, BeginTransferRequest, CutoverRequest, PrepareReceiveRequest,
    ReleaseRequest,
};
use crate::shard::map::{ShardMap, ShardMapSnapshot};
use crate::shard::types::{MapVersion, NodeEndpoint, NodeId, ShardId, TaskId, now_ms};
use crate::transport::{DiscoveryApi, NodeApi};

const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ALERT_HISTORY: usize = 256;

/// Everything the Master mutates. Only ever touched under `Master::state`.
struct MasterState {
    map: ShardMap,
    /// Live set as of the last reconcile.
    members: BTreeMap<NodeId, NodeRecord>,
    /// Last known address of every node ever seen, so owners that just died can
    /// still be named in snapshots.
    addresses: BTreeMap<NodeId, String>,
    draining: BTreeSet<NodeId>,
    /// Shards whose owner restarted; their data is gone.
    lost: BTreeSet<ShardId>,
    tasks: BTreeMap<TaskId, MigrationTask>,
    archive: VecDeque<MigrationTask>,
    alerts: VecDeque<Alert>,
    /// Bootstrap grants not yet acknowledged by their owner.
    unactivated: BTreeSet<ShardId>,
    /// Committed moves whose new owner has not acknowledged activation yet.
    /// The shard stays locked and the old owner keeps its retired copy.
    handoffs: BTreeMap<ShardId, Handoff>,
    replan: bool,
}

/// Post-commit work for one move: activate the new owner, then release the old one.
#[derive(Debug, Clone)]
struct Handoff {
    task_id: TaskId,
    destination: NodeId,
    /// `None` for a recovery, where no copy is left to release.
    source: Option<NodeId>,
    version: MapVersion,
    shard_count: u32,
}

impl MasterState {
    fn eligible(&self) -> BTreeSet<NodeId> {
        self.members
            .values()
            .filter(|r| r.state == NodeState::Alive && !self.draining.contains(&r.node_id))
            .map(|r| r.node_id)
            .collect()
    }

    fn endpoint(&self, node: NodeId) -> Option<NodeEndpoint> {
        self.addresses
            .get(&node)
            .map(|address| NodeEndpoint::new(node, address.clone()))
    }

    fn busy_shards(&self) -> BTreeSet<ShardId> {
        self.tasks
            .values()
            .map(|t| t.shard)
            .chain(self.handoffs.keys().copied())
            .collect()
    }

    fn plan_input(&self) -> PlanInput {
        let mut owners: BTreeMap<ShardId, NodeId> =
            self.map.assignments().map(|a| (a.shard, a.owner)).collect();
        for task in self.tasks.values().filter(|t| !t.phase.is_terminal()) {
            owners.insert(task.shard, task.destination);
        }

        PlanInput {
            owners,
            busy: self.busy_shards(),
            eligible: self.eligible(),
            live: self.members.keys().copied().collect(),
            draining: self.draining.clone(),
            lost: self.lost.clone(),
        }
    }

    fn raise_alert(&mut self, error: ClusterError, message: String) {
        tracing::error!(error = %error, "{}", message);
        self.alerts.push_back(Alert {
            raised_at_ms: now_ms(),
            error,
            message,
        });
        while self.alerts.len() > ALERT_HISTORY {
            self.alerts.pop_front();
        }
    }

    fn archive(&mut self, task_id: &TaskId, history: usize) {
        if let Some(task) = self.tasks.remove(task_id) {
            self.archive.push_back(task);
            while self.archive.len() > history {
                self.archive.pop_front();
            }
        }
    }

    fn find_task(&self, task_id: &TaskId) -> Option<&MigrationTask> {
        self.tasks
            .get(task_id)
            .or_else(|| self.archive.iter().rev().find(|t| t.task_id == *task_id))
    }
}

enum CommitOutcome {
    Committed(Handoff),
    Skipped(MigrationPhase),
}

/// The single writer of the shard map.
///
/// Membership comes from Discovery, progress from source nodes; every decision
/// (plan, commit, abort) is taken under one lock and published as a new
/// immutable snapshot. RPCs to nodes are never made while that lock is held.
pub struct Master {
    config: MasterConfig,
    epoch: u64,
    state: Mutex<MasterState>,
    published: RwLock<Arc<ShardMapSnapshot>>,
    discovery: Arc<dyn DiscoveryApi>,
    nodes: Arc<dyn NodeApi>,
    log: Arc<dyn MapLog>,
    signals: DashMap<TaskId, Arc<Notify>>,
}

impl Master {
    /// Rebuilds the map from the commit log. In-flight tasks of a previous run
    /// were never logged and are not resumed.
    pub fn new(
        config: MasterConfig,
        discovery: Arc<dyn DiscoveryApi>,
        nodes: Arc<dyn NodeApi>,
        log: Arc<dyn MapLog>,
    ) -> ClusterResult<Arc<Self>> {
        let mut map = ShardMap::new(config.shard_count);
        for record in log.replay()? {
            map.apply(&record)?;
        }
        if map.is_bootstrapped() && map.shard_count() != config.shard_count {
            tracing::warn!(
                configured = config.shard_count,
                logged = map.shard_count(),
                "Shard count is fixed at bootstrap, ignoring configured value"
            );
        }

        let unactivated = if map.version() == 1 {
            map.assignments().map(|a| a.shard).collect()
        } else {
            BTreeSet::new()
        };

        let epoch = rand::random::<u64>().max(1);
        tracing::info!(
            epoch,
            version = map.version(),
            shards = map.shard_count(),
            "Master started"
        );

        let published = Arc::new(map.snapshot(Vec::new(), epoch));
        Ok(Arc::new(Self {
            config,
            epoch,
            state: Mutex::new(MasterState {
                map,
                members: BTreeMap::new(),
                addresses: BTreeMap::new(),
                draining: BTreeSet::new(),
                lost: BTreeSet::new(),
                tasks: BTreeMap::new(),
                archive: VecDeque::new(),
                alerts: VecDeque::new(),
                unactivated,
                handoffs: BTreeMap::new(),
                replan: true,
            }),
            published: RwLock::new(published),
            discovery,
            nodes,
            log,
            signals: DashMap::new(),
        }))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Latest committed snapshot. Never a partial view.
    pub fn get_shard_map(&self) -> Arc<ShardMapSnapshot> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, st: &MasterState) {
        let mut ids: BTreeSet<NodeId> = st.members.keys().copied().collect();
        ids.extend(st.map.assignments().map(|a| a.owner));
        let nodes = ids.into_iter().filter_map(|id| st.endpoint(id)).collect();

        let snapshot = Arc::new(st.map.snapshot(nodes, self.epoch));
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn signal(&self, task_id: &TaskId) {
        if let Some(notify) = self.signals.get(task_id) {
            notify.notify_one();
        }
    }

    // --- Reconciliation ---

    /// One pass of the control loop: fold in membership changes, abort tasks
    /// that lost a participant, retry pending rollbacks, bootstrap or re-plan,
    /// and return the tasks that still need driving.
    pub async fn reconcile_once(&self) -> ClusterResult<Vec<TaskId>> {
        let alive = self.discovery.list_alive().await?;

        let to_abort = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let current: BTreeMap<NodeId, NodeRecord> =
                alive.into_iter().map(|r| (r.node_id, r)).collect();

            let mut departed = BTreeSet::new();
            for (id, old) in &st.members {
                match current.get(id) {
                    None => {
                        tracing::warn!(node_id = id.0, "Node left the live set");
                        departed.insert(*id);
                    }
                    Some(now) if now.incarnation != old.incarnation => {
                        tracing::warn!(
                            node_id = id.0,
                            incarnation = now.incarnation,
                            "Node restarted, its shards are lost"
                        );
                        departed.insert(*id);
                        st.lost.extend(st.map.shards_of(*id));
                    }
                    _ => {}
                }
            }
            let joined: Vec<NodeId> = current
                .keys()
                .filter(|id| !st.members.contains_key(id))
                .copied()
                .collect();
            for id in &joined {
                tracing::info!(node_id = id.0, "Node joined the live set");
            }

            for record in current.values() {
                st.addresses.insert(record.node_id, record.address.clone());
            }
            st.draining.retain(|id| current.contains_key(id));
            if !departed.is_empty() || !joined.is_empty() {
                st.replan = true;
            }

            let mut to_abort = Vec::new();
            for task in st.tasks.values_mut() {
                task.pending_rollback
                    .retain(|n| current.contains_key(n) && !departed.contains(n));
                if task.phase.is_terminal() {
                    continue;
                }
                if let Some(gone) = [task.source, task.destination]
                    .into_iter()
                    .find(|n| departed.contains(n))
                {
                    to_abort.push((task.task_id.clone(), format!("{} departed", gone)));
                }
            }

            // A departed destination lost whatever it received; the planner
            // recovers the shard instead.
            st.handoffs.retain(|shard, h| {
                let keep = !departed.contains(&h.destination) && current.contains_key(&h.destination);
                if !keep {
                    tracing::warn!(shard, task_id = %h.task_id, "New owner left before activation");
                }
                keep
            });

            st.members = current;
            to_abort
        };

        for (task_id, reason) in to_abort {
            self.abort_task(&task_id, reason).await;
        }
        self.retry_rollbacks().await;

        let (activations, handoffs, drained, dispatchable) = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let history = self.config.task_history;

            let finished: Vec<TaskId> = st
                .tasks
                .values()
                .filter(|t| t.is_finished())
                .map(|t| t.task_id.clone())
                .collect();
            for task_id in finished {
                st.archive(&task_id, history);
            }

            if !st.map.is_bootstrapped() {
                let eligible: Vec<NodeId> = st.eligible().into_iter().collect();
                if !eligible.is_empty() && eligible.len() >= self.config.bootstrap_min_nodes {
                    let record = st.map.bootstrap_record(&eligible)?;
                    self.log.append(&record)?;
                    st.map.apply(&record)?;
                    st.unactivated = (0..st.map.shard_count()).collect();
                    st.replan = false;
                    tracing::info!(
                        version = st.map.version(),
                        shards = st.map.shard_count(),
                        nodes = eligible.len(),
                        "Bootstrapped shard map"
                    );
                }
            }

            if st.replan && st.map.is_bootstrapped() {
                st.replan = false;
                for planned in plan(&st.plan_input()) {
                    let task =
                        MigrationTask::new(planned.shard, planned.from, planned.to, planned.kind);
                    tracing::info!(
                        task_id = %task.task_id,
                        shard = task.shard,
                        from = task.source.0,
                        to = task.destination.0,
                        kind = ?task.kind,
                        "Planned migration"
                    );
                    st.tasks.insert(task.task_id.clone(), task);
                }
            }

            let members = &st.members;
            let map = &st.map;
            st.unactivated.retain(|shard| {
                map.owner(*shard)
                    .is_some_and(|owner| members.contains_key(&owner))
            });
            let activations: Vec<(NodeEndpoint, ActivateRequest)> = st
                .unactivated
                .iter()
                .filter_map(|shard| {
                    let assignment = st.map.assignment(*shard)?;
                    let endpoint = st.endpoint(assignment.owner)?;
                    Some((
                        endpoint,
                        ActivateRequest {
                            task_id: None,
                            shard: *shard,
                            version: assignment.version,
                            shard_count: st.map.shard_count(),
                        },
                    ))
                })
                .collect();

            let handoffs: Vec<(ShardId, Handoff)> = st
                .handoffs
                .iter()
                .map(|(shard, h)| (*shard, h.clone()))
                .collect();

            let drained: Vec<NodeId> = st
                .draining
                .iter()
                .filter(|n| {
                    st.map.shards_of(**n).is_empty() && !st.tasks.values().any(|t| t.involves(**n))
                })
                .copied()
                .collect();

            self.publish(st);

            let dispatchable: Vec<TaskId> = st
                .tasks
                .values()
                .filter(|t| !t.phase.is_terminal())
                .map(|t| t.task_id.clone())
                .collect();

            (activations, handoffs, drained, dispatchable)
        };

        let mut activated = Vec::new();
        for (endpoint, req) in activations {
            let shard = req.shard;
            match self.nodes.activate(&endpoint, req).await {
                Ok(()) => activated.push(shard),
                Err(e) => tracing::debug!(shard, node_id = endpoint.node_id.0, error = %e, "Bootstrap activation pending"),
            }
        }
        if !activated.is_empty() {
            let mut st = self.state.lock().await;
            for shard in activated {
                st.unactivated.remove(&shard);
            }
        }

        for (shard, handoff) in handoffs {
            if self.complete_handoff(shard, &handoff).await {
                self.clear_handoff(shard, &handoff.task_id).await;
            }
        }

        for node in drained {
            match self.discovery.deregister(node).await {
                Ok(()) | Err(ClusterError::UnknownNode(_)) => {
                    tracing::info!(node_id = node.0, "Decommissioned node drained and deregistered");
                    self.state.lock().await.draining.remove(&node);
                }
                Err(e) => tracing::warn!(node_id = node.0, error = %e, "Failed to deregister drained node"),
            }
        }

        Ok(dispatchable)
    }

    // --- Task state machine ---

    /// Moves a task forward by at most one phase and returns where it stands.
    ///
    /// `Planned → DataCopying` once the destination has room; `DataCopying →
    /// Cutover → Committed` once the destination caught up. Any unexpected node
    /// response aborts the task.
    pub async fn advance(&self, task_id: &TaskId) -> ClusterResult<MigrationPhase> {
        let task = {
            let st = self.state.lock().await;
            st.find_task(task_id)
                .cloned()
                .ok_or_else(|| ClusterError::UnknownTask(task_id.clone()))?
        };

        match task.phase {
            MigrationPhase::Committed | MigrationPhase::Aborted => Ok(task.phase),
            MigrationPhase::Planned => self.start_task(task).await,
            MigrationPhase::DataCopying | MigrationPhase::Cutover => self.finish_task(task).await,
        }
    }

    async fn start_task(&self, task: MigrationTask) -> ClusterResult<MigrationPhase> {
        let endpoints = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let inbound = st
                .tasks
                .values()
                .filter(|t| t.destination == task.destination && t.phase.is_in_flight())
                .count();
            if inbound >= self.config.max_inbound_migrations {
                return Ok(MigrationPhase::Planned);
            }

            let endpoints = (st.endpoint(task.source), st.endpoint(task.destination));
            let Some(t) = st.tasks.get_mut(&task.task_id) else {
                return Err(ClusterError::UnknownTask(task.task_id));
            };
            if t.phase != MigrationPhase::Planned {
                return Ok(t.phase);
            }
            t.set_phase(MigrationPhase::DataCopying);
            t.catch_up_deadline = Some(Instant::now() + self.config.catch_up_timeout());

            if task.kind == MigrationKind::Recovery {
                t.caught_up = true;
                st.raise_alert(
                    ClusterError::DataLossRisk {
                        shard: task.shard,
                        node_id: task.source,
                    },
                    format!(
                        "shard {} is being recreated empty on {}: its owner {} is gone",
                        task.shard, task.destination, task.source
                    ),
                );
            }
            endpoints
        };

        let (source, destination) = match endpoints {
            (source, Some(destination)) => (source, destination),
            (_, None) => {
                return self
                    .fail(&task.task_id, format!("no address for {}", task.destination))
                    .await;
            }
        };

        let recovery = task.kind == MigrationKind::Recovery;
        let prepare = PrepareReceiveRequest {
            task_id: task.task_id.clone(),
            shard: task.shard,
            source: (!recovery).then_some(task.source),
        };
        if let Err(e) = self.nodes.prepare_receive(&destination, prepare).await {
            return self
                .fail(&task.task_id, format!("destination refused to prepare: {}", e))
                .await;
        }

        if !recovery {
            let Some(source) = source else {
                return self
                    .fail(&task.task_id, format!("no address for {}", task.source))
                    .await;
            };
            let begin = BeginTransferRequest {
                task_id: task.task_id.clone(),
                shard: task.shard,
                destination,
            };
            if let Err(e) = self.nodes.begin_snapshot_transfer(&source, begin).await {
                return self
                    .fail(&task.task_id, format!("source refused to stream: {}", e))
                    .await;
            }
        }

        tracing::info!(
            task_id = %task.task_id,
            shard = task.shard,
            from = task.source.0,
            to = task.destination.0,
            "Migration copying data"
        );
        Ok(MigrationPhase::DataCopying)
    }

    async fn finish_task(&self, task: MigrationTask) -> ClusterResult<MigrationPhase> {
        if !task.caught_up {
            if task
                .catch_up_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
            {
                let reason = format!(
                    "destination did not catch up within {:?}",
                    self.config.catch_up_timeout()
                );
                self.abort_task(&task.task_id, reason).await;
                return Ok(MigrationPhase::Aborted);
            }
            return Ok(task.phase);
        }

        let source = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let source = st.endpoint(task.source);
            let Some(t) = st.tasks.get_mut(&task.task_id) else {
                return Err(ClusterError::UnknownTask(task.task_id));
            };
            if t.phase.is_terminal() {
                return Ok(t.phase);
            }
            t.set_phase(MigrationPhase::Cutover);
            source
        };

        if task.kind != MigrationKind::Recovery {
            let Some(source) = source else {
                return self
                    .fail(&task.task_id, format!("no address for {}", task.source))
                    .await;
            };
            let req = CutoverRequest {
                task_id: task.task_id.clone(),
                shard: task.shard,
            };
            match self.nodes.cutover(&source, req).await {
                Ok(ack) => tracing::debug!(
                    task_id = %task.task_id,
                    final_seq = ack.final_seq,
                    "Source retired shard"
                ),
                Err(e) => {
                    return self
                        .fail(&task.task_id, format!("cutover failed: {}", e))
                        .await;
                }
            }
        }

        let outcome = {
            let mut guard = self.state.lock().await;
            self.commit_locked(&mut guard, &task)
        };
        let handoff = match outcome {
            Ok(CommitOutcome::Committed(handoff)) => handoff,
            Ok(CommitOutcome::Skipped(phase)) => return Ok(phase),
            Err(e) => {
                return self
                    .fail(&task.task_id, format!("commit failed: {}", e))
                    .await;
            }
        };
        self.signal(&task.task_id);

        if self.complete_handoff(task.shard, &handoff).await {
            self.clear_handoff(task.shard, &task.task_id).await;
        } else {
            tracing::warn!(
                task_id = %task.task_id,
                shard = task.shard,
                "New owner did not confirm activation, retrying on reconcile"
            );
        }

        Ok(MigrationPhase::Committed)
    }

    /// Activates the new owner and, only once it acknowledged, releases the old
    /// copy. Returns whether the new owner is serving. A failed release is left
    /// to the old owner's map sync.
    async fn complete_handoff(&self, shard: ShardId, handoff: &Handoff) -> bool {
        let (destination, source) = {
            let st = self.state.lock().await;
            (
                st.endpoint(handoff.destination),
                handoff.source.and_then(|n| st.endpoint(n)),
            )
        };
        let Some(destination) = destination else {
            return false;
        };

        let req = ActivateRequest {
            task_id: Some(handoff.task_id.clone()),
            shard,
            version: handoff.version,
            shard_count: handoff.shard_count,
        };
        if let Err(e) = self.nodes.activate(&destination, req).await {
            tracing::warn!(task_id = %handoff.task_id, shard, error = %e, "Activation not acknowledged");
            return false;
        }

        if let Some(source) = source {
            let req = ReleaseRequest {
                task_id: handoff.task_id.clone(),
                shard,
                version: handoff.version,
            };
            if let Err(e) = self.nodes.release(&source, req).await {
                tracing::warn!(task_id = %handoff.task_id, shard, error = %e, "Release not acknowledged");
            }
        }
        true
    }

    async fn clear_handoff(&self, shard: ShardId, task_id: &TaskId) {
        let mut st = self.state.lock().await;
        if st.handoffs.get(&shard).is_some_and(|h| h.task_id == *task_id) {
            st.handoffs.remove(&shard);
        }
    }

    /// Logs and applies the move. The old owner loses the shard in the same
    /// step the new one gains it.
    fn commit_locked(
        &self,
        st: &mut MasterState,
        task: &MigrationTask,
    ) -> ClusterResult<CommitOutcome> {
        match st.tasks.get(&task.task_id) {
            Some(t) if t.phase == MigrationPhase::Cutover => {}
            Some(t) => return Ok(CommitOutcome::Skipped(t.phase)),
            None => return Err(ClusterError::UnknownTask(task.task_id.clone())),
        }

        let record =
            st.map
                .move_record(&task.task_id, task.shard, task.source, task.destination)?;
        self.log.append(&record)?;
        st.map.apply(&record)?;

        if let Some(t) = st.tasks.get_mut(&task.task_id) {
            t.set_phase(MigrationPhase::Committed);
        }
        st.lost.remove(&task.shard);
        let handoff = Handoff {
            task_id: task.task_id.clone(),
            destination: task.destination,
            source: (task.kind != MigrationKind::Recovery).then_some(task.source),
            version: st.map.version(),
            shard_count: st.map.shard_count(),
        };
        st.handoffs.insert(task.shard, handoff.clone());
        st.archive(&task.task_id, self.config.task_history);
        self.publish(st);

        tracing::info!(
            task_id = %task.task_id,
            shard = task.shard,
            owner = task.destination.0,
            version = st.map.version(),
            "Migration committed"
        );
        Ok(CommitOutcome::Committed(handoff))
    }

    async fn fail(&self, task_id: &TaskId, reason: String) -> ClusterResult<MigrationPhase> {
        self.abort_task(task_id, reason.clone()).await;
        Err(ClusterError::MigrationAborted {
            task_id: task_id.clone(),
            reason,
        })
    }

    /// Marks the task `Aborted` and asks the surviving participants to roll back.
    ///
    /// The map is untouched: the shard stays with its committed owner. The shard
    /// stays locked until every live participant acknowledged.
    pub async fn abort_task(&self, task_id: &TaskId, reason: String) {
        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let members = &st.members;
            let Some(task) = st.tasks.get_mut(task_id) else {
                return;
            };
            if task.phase.is_terminal() {
                return;
            }

            let mut participants = vec![task.destination];
            if task.kind != MigrationKind::Recovery {
                participants.push(task.source);
            }
            task.pending_rollback = participants
                .into_iter()
                .filter(|n| members.contains_key(n))
                .collect();
            task.set_phase(MigrationPhase::Aborted);
            task.reason = Some(reason.clone());
            st.replan = true;

            tracing::warn!(
                task_id = %task_id,
                shard = task.shard,
                from = task.source.0,
                to = task.destination.0,
                reason = %reason,
                "Migration aborted"
            );
        }

        self.signal(task_id);
        self.rollback(task_id).await;
    }

    async fn rollback(&self, task_id: &TaskId) {
        let (shard, targets) = {
            let st = self.state.lock().await;
            let Some(task) = st.tasks.get(task_id) else {
                return;
            };
            let targets: Vec<NodeEndpoint> = task
                .pending_rollback
                .iter()
                .filter_map(|n| st.endpoint(*n))
                .collect();
            (task.shard, targets)
        };

        let mut acked = Vec::new();
        let mut failed = Vec::new();
        for endpoint in targets {
            let req = AbortRequest {
                task_id: task_id.clone(),
                shard,
            };
            match self.nodes.abort_migration(&endpoint, req).await {
                Ok(()) => acked.push(endpoint.node_id),
                Err(e) => {
                    tracing::warn!(
                        task_id = %task_id,
                        node_id = endpoint.node_id.0,
                        error = %e,
                        "Rollback not acknowledged"
                    );
                    failed.push(endpoint.node_id);
                }
            }
        }

        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let Some(task) = st.tasks.get_mut(task_id) else {
            return;
        };
        for node in acked {
            task.pending_rollback.remove(&node);
        }
        if !failed.is_empty() {
            task.rollback_failures += 1;
            if task.rollback_failures == self.config.rollback_alert_after {
                let error = ClusterError::MigrationAborted {
                    task_id: task_id.clone(),
                    reason: task.reason.clone().unwrap_or_default(),
                };
                let message = format!(
                    "shard {} stays locked: rollback not acknowledged by {:?} after {} attempts",
                    shard, failed, task.rollback_failures
                );
                st.raise_alert(error, message);
            }
        } else if task.is_finished() {
            st.archive(task_id, self.config.task_history);
        }
    }

    async fn retry_rollbacks(&self) {
        let pending: Vec<TaskId> = {
            let st = self.state.lock().await;
            st.tasks
                .values()
                .filter(|t| t.phase == MigrationPhase::Aborted && !t.pending_rollback.is_empty())
                .map(|t| t.task_id.clone())
                .collect()
        };
        for task_id in pending {
            self.rollback(&task_id).await;
        }
    }

    pub async fn report_migration_progress(&self, report: ProgressReport) -> ClusterResult<()> {
        let failure = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let Some(task) = st.tasks.get_mut(&report.task_id) else {
                if st.find_task(&report.task_id).is_some() {
                    return Ok(());
                }
                return Err(ClusterError::UnknownTask(report.task_id));
            };
            if task.source != report.reporter || task.shard != report.shard {
                return Err(ClusterError::InvalidShardState {
                    shard: report.shard,
                    state: format!("streamed by {}", task.source),
                    operation: format!("accept progress from {}", report.reporter),
                });
            }
            if task.phase.is_terminal() {
                return Ok(());
            }

            match report.progress {
                MigrationProgress::SnapshotInstalled { entries } => {
                    task.snapshot_entries = Some(entries);
                    tracing::debug!(task_id = %report.task_id, entries, "Snapshot installed");
                    None
                }
                MigrationProgress::CaughtUp { lag } => {
                    task.caught_up = true;
                    tracing::info!(task_id = %report.task_id, lag, "Destination caught up");
                    None
                }
                MigrationProgress::Failed { reason } => Some(reason),
            }
        };

        if let Some(reason) = failure {
            self.abort_task(&report.task_id, format!("source reported: {}", reason))
                .await;
        }
        self.signal(&report.task_id);
        Ok(())
    }

    // --- Operator commands ---

    /// Queues a single explicit move. Driven like any planned task.
    pub async fn move_shard(&self, shard: ShardId, destination: NodeId) -> ClusterResult<TaskId> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if !st.map.is_bootstrapped() {
            return Err(ClusterError::NoShardMap);
        }
        let owner = st.map.owner(shard).ok_or(ClusterError::NoShardMap)?;
        if st.busy_shards().contains(&shard) {
            return Err(ClusterError::InvalidShardState {
                shard,
                state: "migrating".to_string(),
                operation: "move".to_string(),
            });
        }
        if !st.members.contains_key(&destination) {
            return Err(ClusterError::UnknownNode(destination));
        }
        if !st.eligible().contains(&destination) || owner == destination {
            return Err(ClusterError::InvalidShardState {
                shard,
                state: format!("owned by {}", owner),
                operation: format!("move to {}", destination),
            });
        }

        let kind = if st.members.contains_key(&owner) && !st.lost.contains(&shard) {
            MigrationKind::Manual
        } else {
            MigrationKind::Recovery
        };
        let task = MigrationTask::new(shard, owner, destination, kind);
        let task_id = task.task_id.clone();
        tracing::info!(task_id = %task_id, shard, from = owner.0, to = destination.0, "Operator requested move");
        st.tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// Drains every shard off `node` through normal migrations, then deregisters it.
    pub async fn decommission(&self, node: NodeId) -> ClusterResult<()> {
        let mut st = self.state.lock().await;
        if !st.members.contains_key(&node) {
            return Err(ClusterError::UnknownNode(node));
        }
        st.draining.insert(node);
        st.replan = true;
        tracing::info!(node_id = node.0, "Decommissioning node");
        Ok(())
    }

    pub async fn request_rebalance(&self) -> ClusterResult<Vec<TaskId>> {
        self.state.lock().await.replan = true;
        self.reconcile_once().await
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<MigrationTask> {
        self.state.lock().await.find_task(task_id).cloned()
    }

    pub async fn status(&self) -> MasterStatus {
        let st = self.state.lock().await;
        let load = st.map.load();
        let members = st
            .members
            .values()
            .map(|r| MemberView {
                node_id: r.node_id,
                address: r.address.clone(),
                state: r.state,
                incarnation: r.incarnation,
                shards: load.get(&r.node_id).copied().unwrap_or(0),
                draining: st.draining.contains(&r.node_id),
            })
            .collect();

        MasterStatus {
            epoch: self.epoch,
            map: self.get_shard_map().as_ref().clone(),
            active: st.tasks.values().cloned().collect(),
            history: st.archive.iter().cloned().collect(),
            alerts: st.alerts.iter().cloned().collect(),
            members,
        }
    }

    // --- Background driving ---

    /// Drives `task_id` to a terminal phase unless a driver already runs for it.
    pub fn spawn_driver(self: &Arc<Self>, task_id: TaskId) {
        let notify = match self.signals.entry(task_id.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => vacant.insert(Arc::new(Notify::new())).clone(),
        };

        let master = self.clone();
        tokio::spawn(async move {
            loop {
                match master.advance(&task_id).await {
                    Ok(phase) if phase.is_terminal() => break,
                    Ok(_) => {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = tokio::time::sleep(DRIVER_POLL_INTERVAL) => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "Migration driver stopped");
                        break;
                    }
                }
            }
            master.signals.remove(&task_id);
        });
    }

    /// Runs the reconcile loop and spawns a driver for every dispatchable task.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let master = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(master.config.reconcile_interval());
            loop {
                interval.tick().await;
                match master.reconcile_once().await {
                    Ok(tasks) => {
                        for task_id in tasks {
                            master.spawn_driver(task_id);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Reconcile failed"),
                }
            }
        })
    }
}
