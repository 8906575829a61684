use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;

use super::protocol::{
    AbortRequest, ActivateRequest, ApplyDeltaRequest, BeginTransferRequest, CutoverAck,
    CutoverRequest, InstallSnapshotRequest, PrepareReceiveRequest, ReleaseRequest,
};
use super::types::{DeltaLog, Mutation, NodeStatus, ShardStatus, SlotState};
use crate::config::NodeConfig;
use crate::discovery::types::RegisterOutcome;
use crate::error::{ClusterError, ClusterResult};
use crate::master::protocol::ProgressReport;
use crate::master::types::MigrationProgress;
use crate::shard::map::ShardMapSnapshot;
use crate::shard::partitioner::shard_for_key;
use crate::shard::types::{MapVersion, NodeEndpoint, NodeId, ShardId, TaskId};
use crate::storage::ShardStore;
use crate::transport::{DiscoveryApi, MasterApi, NodeApi};

/// Local state of one hosted shard.
///
/// Data operations hold the state read lock for their whole duration, so a
/// transition (which takes the write lock) waits for in-flight writes to drain
/// and no write can slip past a `MigratingOut → Retired` cutover unlogged.
pub struct ShardSlot {
    state: RwLock<SlotState>,
    /// Map version at which this node was granted the shard.
    owner_version: AtomicU64,
    delta: Mutex<DeltaLog>,
}

impl ShardSlot {
    fn new(state: SlotState, owner_version: MapVersion) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
            owner_version: AtomicU64::new(owner_version),
            delta: Mutex::new(DeltaLog::default()),
        })
    }

    fn state(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn delta(&self) -> MutexGuard<'_, DeltaLog> {
        self.delta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner_version(&self) -> MapVersion {
        self.owner_version.load(Ordering::SeqCst)
    }

    fn is_migrating_out(&self, task: &TaskId) -> bool {
        matches!(&*self.state(), SlotState::MigratingOut { task_id, .. } if task_id == task)
    }
}

fn invalid(shard: ShardId, state: &SlotState, operation: &str) -> ClusterError {
    ClusterError::InvalidShardState {
        shard,
        state: state.name().to_string(),
        operation: operation.to_string(),
    }
}

fn absent(shard: ShardId, operation: &str) -> ClusterError {
    ClusterError::InvalidShardState {
        shard,
        state: "absent".to_string(),
        operation: operation.to_string(),
    }
}

/// A storage node: serves the shards it owns and plays either side of a migration.
///
/// The agent never changes the shard map. It reports facts (heartbeats,
/// migration progress) and follows the versions the Master publishes.
pub struct NodeAgent {
    node_id: NodeId,
    endpoint: NodeEndpoint,
    boot_id: String,
    config: NodeConfig,
    store: ShardStore,
    slots: DashMap<ShardId, Arc<ShardSlot>>,
    known_version: AtomicU64,
    shard_count: AtomicU32,
    master_epoch: AtomicU64,
    discovery: Arc<dyn DiscoveryApi>,
    master: Arc<dyn MasterApi>,
    peers: Arc<dyn NodeApi>,
}

impl NodeAgent {
    pub fn new(
        node_id: NodeId,
        address: impl Into<String>,
        config: NodeConfig,
        discovery: Arc<dyn DiscoveryApi>,
        master: Arc<dyn MasterApi>,
        peers: Arc<dyn NodeApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            endpoint: NodeEndpoint::new(node_id, address),
            boot_id: uuid::Uuid::new_v4().to_string(),
            config,
            store: ShardStore::new(),
            slots: DashMap::new(),
            known_version: AtomicU64::new(0),
            shard_count: AtomicU32::new(0),
            master_epoch: AtomicU64::new(0),
            discovery,
            master,
            peers,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn known_version(&self) -> MapVersion {
        self.known_version.load(Ordering::SeqCst)
    }

    fn observe_version(&self, version: MapVersion) {
        self.known_version.fetch_max(version, Ordering::SeqCst);
    }

    fn note_shard_count(&self, shard_count: u32) {
        if shard_count > 0 {
            self.shard_count.store(shard_count, Ordering::SeqCst);
        }
    }

    /// Clones the slot out so no map guard is held while its state is locked.
    fn slot(&self, shard: ShardId) -> Option<Arc<ShardSlot>> {
        self.slots.get(&shard).map(|s| s.value().clone())
    }

    fn not_owner(&self, shard: ShardId) -> ClusterError {
        ClusterError::NotOwner {
            shard,
            current_version: self.known_version(),
        }
    }

    /// Removes `slot` (and its data) only if it is still the registered one.
    fn remove_slot(&self, shard: ShardId, slot: &Arc<ShardSlot>) -> usize {
        if self
            .slots
            .remove_if(&shard, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            self.store.drop_shard(shard)
        } else {
            0
        }
    }

    // --- Data plane ---

    fn locate(&self, key: &str) -> ClusterResult<(ShardId, Arc<ShardSlot>)> {
        let shard_count = self.shard_count.load(Ordering::SeqCst);
        let shard = shard_for_key(key, shard_count);
        if shard_count == 0 {
            return Err(self.not_owner(shard));
        }
        let slot = self.slot(shard).ok_or_else(|| self.not_owner(shard))?;
        Ok((shard, slot))
    }

    pub fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        let (shard, slot) = self.locate(key)?;
        let state = slot.state();
        if !state.is_serving() {
            return Err(self.not_owner(shard));
        }
        self.store.get(shard, key)
    }

    pub fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.write(Mutation::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .map(|_| ())
    }

    pub fn delete(&self, key: &str) -> ClusterResult<bool> {
        self.write(Mutation::Delete {
            key: key.to_string(),
        })
        .map(|previous| previous.is_some())
    }

    fn write(&self, mutation: Mutation) -> ClusterResult<Option<String>> {
        let (shard, slot) = self.locate(mutation.key())?;
        let state = slot.state();
        match &*state {
            SlotState::Stable => self.apply_mutation(shard, &mutation),
            SlotState::MigratingOut { .. } => {
                let previous = self.apply_mutation(shard, &mutation)?;
                slot.delta().push(mutation);
                Ok(previous)
            }
            _ => Err(self.not_owner(shard)),
        }
    }

    fn apply_mutation(&self, shard: ShardId, mutation: &Mutation) -> ClusterResult<Option<String>> {
        match mutation {
            Mutation::Put { key, value } => self.store.put(shard, key.clone(), value.clone()),
            Mutation::Delete { key } => self.store.delete(shard, key),
        }
    }

    // --- Migration plane: destination side ---

    pub fn prepare_receive(&self, req: PrepareReceiveRequest) -> ClusterResult<()> {
        let shard = req.shard;
        if let Some(slot) = self.slot(shard) {
            let state = slot.state();
            return match &*state {
                SlotState::MigratingIn { task_id, .. } if *task_id == req.task_id => Ok(()),
                other => Err(invalid(shard, other, "prepare receive")),
            };
        }

        match self.slots.entry(shard) {
            Entry::Occupied(_) => Err(ClusterError::InvalidShardState {
                shard,
                state: "changing".to_string(),
                operation: "prepare receive".to_string(),
            }),
            Entry::Vacant(vacant) => {
                // Leftovers from an earlier, abandoned ownership are never merged in.
                self.store.drop_shard(shard);
                self.store.create_shard(shard);
                vacant.insert(ShardSlot::new(
                    SlotState::MigratingIn {
                        task_id: req.task_id.clone(),
                        source: req.source,
                        applied_seq: 0,
                    },
                    0,
                ));
                tracing::info!(
                    shard,
                    task_id = %req.task_id,
                    source = ?req.source,
                    "Prepared to receive shard"
                );
                Ok(())
            }
        }
    }

    pub fn install_snapshot(&self, req: InstallSnapshotRequest) -> ClusterResult<usize> {
        let shard = req.shard;
        let slot = self
            .slot(shard)
            .ok_or_else(|| absent(shard, "install snapshot"))?;
        let state = slot.state_mut();
        match &*state {
            SlotState::MigratingIn { task_id, .. } if *task_id == req.task_id => {
                self.store.put_all(shard, req.entries)
            }
            other => Err(invalid(shard, other, "install snapshot")),
        }
    }

    /// Applies a batch in sequence order. Already-applied ops are skipped, a gap is refused.
    pub fn apply_delta(&self, req: ApplyDeltaRequest) -> ClusterResult<u64> {
        let shard = req.shard;
        let slot = self.slot(shard).ok_or_else(|| absent(shard, "apply delta"))?;
        let mut state = slot.state_mut();
        match &mut *state {
            SlotState::MigratingIn {
                task_id,
                applied_seq,
                ..
            } if *task_id == req.task_id => {
                for op in &req.ops {
                    if op.seq <= *applied_seq {
                        continue;
                    }
                    if op.seq != *applied_seq + 1 {
                        return Err(ClusterError::InvalidShardState {
                            shard,
                            state: format!("MigratingIn at seq {}", applied_seq),
                            operation: format!("apply delta seq {}", op.seq),
                        });
                    }
                    self.apply_mutation(shard, &op.mutation)?;
                    *applied_seq = op.seq;
                }
                Ok(*applied_seq)
            }
            other => Err(invalid(shard, other, "apply delta")),
        }
    }

    /// Starts serving a shard the Master has committed to this node.
    ///
    /// Without a task id this is a bootstrap grant and the shard starts empty.
    pub fn activate(&self, req: ActivateRequest) -> ClusterResult<()> {
        let shard = req.shard;
        self.note_shard_count(req.shard_count);
        self.observe_version(req.version);

        let Some(task) = req.task_id else {
            let slot = match self.slots.entry(shard) {
                Entry::Vacant(vacant) => {
                    self.store.create_shard(shard);
                    vacant.insert(ShardSlot::new(SlotState::Stable, req.version));
                    tracing::info!(shard, version = req.version, "Activated empty shard");
                    return Ok(());
                }
                Entry::Occupied(occupied) => occupied.get().clone(),
            };
            let state = slot.state();
            return match &*state {
                SlotState::Stable => {
                    slot.owner_version.fetch_max(req.version, Ordering::SeqCst);
                    Ok(())
                }
                other => Err(invalid(shard, other, "activate")),
            };
        };

        let slot = self.slot(shard).ok_or_else(|| absent(shard, "activate"))?;
        let mut state = slot.state_mut();
        match &*state {
            SlotState::MigratingIn { task_id, .. } if *task_id == task => {
                *state = SlotState::Stable;
                slot.owner_version.store(req.version, Ordering::SeqCst);
                tracing::info!(shard, task_id = %task, version = req.version, "Shard is now Stable");
                Ok(())
            }
            SlotState::Stable if slot.owner_version() >= req.version => Ok(()),
            other => Err(invalid(shard, other, "activate")),
        }
    }

    // --- Migration plane: source side ---

    /// `Stable → MigratingOut`. The snapshot is taken under the state write lock,
    /// so every earlier write is in it and every later write lands in the delta log.
    pub fn begin_snapshot_transfer(self: &Arc<Self>, req: BeginTransferRequest) -> ClusterResult<()> {
        let shard = req.shard;
        let slot = self.slot(shard).ok_or_else(|| self.not_owner(shard))?;

        let entries = {
            let mut state = slot.state_mut();
            match &*state {
                SlotState::MigratingOut { task_id, .. } if *task_id == req.task_id => return Ok(()),
                SlotState::Stable => {}
                other => return Err(invalid(shard, other, "begin snapshot transfer")),
            }
            slot.delta().reset();
            let entries = self.store.scan(shard)?;
            *state = SlotState::MigratingOut {
                task_id: req.task_id.clone(),
                destination: req.destination.clone(),
            };
            entries
        };

        tracing::info!(
            shard,
            task_id = %req.task_id,
            destination = %req.destination.node_id,
            entries = entries.len(),
            "Streaming shard"
        );

        let agent = self.clone();
        tokio::spawn(async move {
            agent
                .stream_shard(slot, shard, req.task_id, req.destination, entries)
                .await;
        });
        Ok(())
    }

    async fn stream_shard(
        self: Arc<Self>,
        slot: Arc<ShardSlot>,
        shard: ShardId,
        task_id: TaskId,
        destination: NodeEndpoint,
        entries: Vec<(String, String)>,
    ) {
        let result = self
            .run_stream(&slot, shard, &task_id, &destination, entries)
            .await;

        if let Err(e) = result
            && slot.is_migrating_out(&task_id)
        {
            tracing::warn!(shard, task_id = %task_id, error = %e, "Shard stream failed");
            let progress = MigrationProgress::Failed {
                reason: e.to_string(),
            };
            if let Err(report_err) = self.report(&task_id, shard, progress).await {
                tracing::warn!(
                    shard,
                    task_id = %task_id,
                    error = %report_err,
                    "Failed to report stream failure"
                );
            }
        }
    }

    async fn run_stream(
        &self,
        slot: &ShardSlot,
        shard: ShardId,
        task_id: &TaskId,
        destination: &NodeEndpoint,
        entries: Vec<(String, String)>,
    ) -> ClusterResult<()> {
        let total = entries.len();
        for chunk in entries.chunks(self.config.snapshot_chunk.max(1)) {
            if !slot.is_migrating_out(task_id) {
                return Ok(());
            }
            let req = InstallSnapshotRequest {
                task_id: task_id.clone(),
                shard,
                entries: chunk.to_vec(),
            };
            self.peers.install_snapshot(destination, req).await?;
        }

        let installed = MigrationProgress::SnapshotInstalled { entries: total };
        if let Err(e) = self.report(task_id, shard, installed).await {
            tracing::warn!(shard, task_id = %task_id, error = %e, "Failed to report snapshot");
        }

        let mut caught_up_reported = false;
        loop {
            if !slot.is_migrating_out(task_id) {
                return Ok(());
            }

            let batch = slot.delta().pending(self.config.delta_batch.max(1));
            let idle = batch.is_empty();
            if !idle {
                let req = ApplyDeltaRequest {
                    task_id: task_id.clone(),
                    shard,
                    ops: batch,
                };
                let applied = self.peers.apply_delta(destination, req).await?;
                slot.delta().ack(applied);
            }

            let lag = slot.delta().ops.len() as u64;
            if lag <= self.config.catch_up_lag_threshold && !caught_up_reported {
                match self
                    .report(task_id, shard, MigrationProgress::CaughtUp { lag })
                    .await
                {
                    Ok(()) => caught_up_reported = true,
                    Err(e) => {
                        tracing::warn!(shard, task_id = %task_id, error = %e, "Failed to report catch-up")
                    }
                }
            }

            if idle {
                tokio::time::sleep(self.config.delta_flush()).await;
            }
        }
    }

    /// Ships every pending delta op to `destination`.
    async fn flush_delta(
        &self,
        slot: &ShardSlot,
        shard: ShardId,
        task_id: &TaskId,
        destination: &NodeEndpoint,
    ) -> ClusterResult<()> {
        loop {
            let batch = slot.delta().pending(self.config.delta_batch.max(1));
            let Some(last) = batch.last().map(|op| op.seq) else {
                return Ok(());
            };
            let req = ApplyDeltaRequest {
                task_id: task_id.clone(),
                shard,
                ops: batch,
            };
            let applied = self.peers.apply_delta(destination, req).await?;
            slot.delta().ack(applied);
            if applied < last {
                return Err(ClusterError::Storage(format!(
                    "destination applied up to {} of {}",
                    applied, last
                )));
            }
        }
    }

    /// `MigratingOut → Retired`: stop serving, then deliver the trailing delta.
    ///
    /// Data stays in place until `release`, so an abort can still restore it.
    pub async fn cutover(&self, req: CutoverRequest) -> ClusterResult<CutoverAck> {
        let shard = req.shard;
        let slot = self.slot(shard).ok_or_else(|| absent(shard, "cutover"))?;

        let destination = {
            let mut state = slot.state_mut();
            match &*state {
                SlotState::MigratingOut {
                    task_id,
                    destination,
                } if *task_id == req.task_id => {
                    let destination = destination.clone();
                    *state = SlotState::Retired {
                        task_id: req.task_id.clone(),
                        destination: destination.clone(),
                    };
                    destination
                }
                SlotState::Retired {
                    task_id,
                    destination,
                } if *task_id == req.task_id => destination.clone(),
                other => return Err(invalid(shard, other, "cutover")),
            }
        };

        self.flush_delta(&slot, shard, &req.task_id, &destination)
            .await?;

        let final_seq = slot.delta().last_seq();
        tracing::info!(shard, task_id = %req.task_id, final_seq, "Shard retired at cutover");
        Ok(CutoverAck { final_seq })
    }

    /// Drops the retired copy once the Master has committed the move.
    pub fn release(&self, req: ReleaseRequest) -> ClusterResult<()> {
        let shard = req.shard;
        self.observe_version(req.version);

        let Some(slot) = self.slot(shard) else {
            return Ok(());
        };
        {
            let state = slot.state();
            match &*state {
                SlotState::Retired { task_id, .. } if *task_id == req.task_id => {}
                other => return Err(invalid(shard, other, "release")),
            }
        }

        let dropped = self.remove_slot(shard, &slot);
        tracing::info!(shard, task_id = %req.task_id, dropped, "Released shard");
        Ok(())
    }

    /// Rolls back this node's half of `task_id`. Idempotent.
    pub fn abort_migration(&self, req: AbortRequest) -> ClusterResult<()> {
        let shard = req.shard;
        let Some(slot) = self.slot(shard) else {
            return Ok(());
        };

        let mut state = slot.state_mut();
        match &*state {
            SlotState::MigratingOut { task_id, .. } | SlotState::Retired { task_id, .. }
                if *task_id == req.task_id =>
            {
                *state = SlotState::Stable;
                slot.delta().reset();
                tracing::info!(shard, task_id = %req.task_id, "Migration rolled back, shard Stable");
            }
            SlotState::MigratingIn { task_id, .. } if *task_id == req.task_id => {
                let dropped = self.remove_slot(shard, &slot);
                tracing::info!(shard, task_id = %req.task_id, dropped, "Discarded incoming shard");
            }
            _ => {}
        }
        Ok(())
    }

    // --- Membership and map following ---

    pub async fn register(&self) -> ClusterResult<RegisterOutcome> {
        let outcome = self
            .discovery
            .register(self.node_id, &self.endpoint.address, &self.boot_id)
            .await?;
        if outcome.rejoined_after_dead {
            self.discard_all("rejoined after being declared dead");
        }
        tracing::info!(
            node_id = self.node_id.0,
            incarnation = outcome.incarnation,
            "Registered with discovery"
        );
        Ok(outcome)
    }

    pub async fn heartbeat_once(&self) -> ClusterResult<()> {
        match self.discovery.heartbeat(self.node_id).await {
            Ok(_) => Ok(()),
            Err(ClusterError::NodeDead(_)) | Err(ClusterError::UnknownNode(_)) => {
                tracing::warn!(node_id = self.node_id.0, "Discovery no longer knows us, re-registering");
                self.register().await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Every hosted shard is stale; nothing is kept.
    pub fn discard_all(&self, reason: &str) {
        let shards = self.slots.len();
        self.slots.clear();
        self.store.clear();
        tracing::warn!(node_id = self.node_id.0, shards, reason, "Discarded all local shards");
    }

    pub async fn sync_map_once(&self) -> ClusterResult<MapVersion> {
        let snapshot = self.master.get_shard_map().await?;
        self.sync_with_map(&snapshot);
        Ok(snapshot.version)
    }

    /// Reconciles local slots with a published map.
    ///
    /// Repairs lost activations and releases, drops `Stable` copies the map has
    /// since granted elsewhere, and after a Master restart rolls back every
    /// migration the map does not confirm.
    pub fn sync_with_map(&self, snapshot: &ShardMapSnapshot) {
        self.observe_version(snapshot.version);
        self.note_shard_count(snapshot.shard_count);
        let previous_epoch = self
            .master_epoch
            .swap(snapshot.master_epoch, Ordering::SeqCst);
        let new_master = previous_epoch != 0 && previous_epoch != snapshot.master_epoch;
        if new_master {
            tracing::warn!(node_id = self.node_id.0, "Master restarted, rolling back unconfirmed migrations");
        }
        if snapshot.version == 0 {
            return;
        }

        let slots: Vec<(ShardId, Arc<ShardSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (shard, slot) in slots {
            let (mine, granted) = match snapshot.assignment(shard) {
                Some(a) => (a.owner == self.node_id, a.version),
                None => (false, 0),
            };
            let granted_elsewhere = !mine && granted > slot.owner_version();

            let mut state = slot.state_mut();
            match &*state {
                SlotState::Stable if granted_elsewhere => {
                    let dropped = self.remove_slot(shard, &slot);
                    tracing::warn!(shard, granted, dropped, "Dropped stale shard owned elsewhere");
                }
                SlotState::MigratingIn { .. } if mine && granted > slot.owner_version() => {
                    *state = SlotState::Stable;
                    slot.owner_version.store(granted, Ordering::SeqCst);
                    tracing::info!(shard, version = granted, "Activated shard from published map");
                }
                SlotState::MigratingIn { .. } if new_master => {
                    self.remove_slot(shard, &slot);
                    tracing::info!(shard, "Discarded unconfirmed incoming shard");
                }
                SlotState::Retired { .. } if granted_elsewhere => {
                    let dropped = self.remove_slot(shard, &slot);
                    tracing::info!(shard, dropped, "Released retired shard from published map");
                }
                SlotState::MigratingOut { .. } | SlotState::Retired { .. } if new_master && mine => {
                    *state = SlotState::Stable;
                    slot.delta().reset();
                    tracing::info!(shard, "Rolled back unconfirmed outgoing migration");
                }
                _ => {}
            }
        }
    }

    /// Spawns the heartbeat and map-sync loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let agent = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(agent.config.heartbeat_interval());
                loop {
                    interval.tick().await;
                    if let Err(e) = agent.heartbeat_once().await {
                        tracing::warn!(node_id = agent.node_id.0, error = %e, "Heartbeat failed");
                    }
                }
            })
        };

        let map_sync = {
            let agent = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(agent.config.map_sync_interval());
                loop {
                    interval.tick().await;
                    if let Err(e) = agent.sync_map_once().await {
                        tracing::debug!(node_id = agent.node_id.0, error = %e, "Map sync failed");
                    }
                }
            })
        };

        vec![heartbeat, map_sync]
    }

    async fn report(
        &self,
        task_id: &TaskId,
        shard: ShardId,
        progress: MigrationProgress,
    ) -> ClusterResult<()> {
        self.master
            .report_migration_progress(ProgressReport {
                task_id: task_id.clone(),
                shard,
                reporter: self.node_id,
                progress,
            })
            .await
    }

    pub fn status(&self) -> NodeStatus {
        let mut shards: Vec<ShardStatus> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(shard, slot)| {
                let state = slot.state().clone();
                ShardStatus {
                    shard,
                    state: state.name().to_string(),
                    task_id: state.task_id().cloned(),
                    entries: self.store.entry_count(shard),
                    pending_delta: slot.delta().ops.len(),
                    owner_version: slot.owner_version(),
                }
            })
            .collect();
        shards.sort_by_key(|s| s.shard);

        NodeStatus {
            node_id: self.node_id,
            address: self.endpoint.address.clone(),
            known_version: self.known_version(),
            shard_count: self.shard_count.load(Ordering::SeqCst),
            master_epoch: self.master_epoch.load(Ordering::SeqCst),
            shards,
        }
    }

    /// Name of the slot state for `shard`, if hosted.
    pub fn shard_state(&self, shard: ShardId) -> Option<SlotState> {
        self.slot(shard).map(|slot| slot.state().clone())
    }
}
