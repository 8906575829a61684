//! Master Module Tests
//!
//! ## Test Scopes
//! - **Bootstrap**: first map version once enough nodes are alive.
//! - **Migration Lifecycle**: operator moves run through every phase and carry data.
//! - **Aborts**: a departed participant, an unreachable destination or a missed
//!   catch-up deadline aborts the task and leaves the committed owner serving.
//! - **Handoff**: the old copy is released only after the new owner activates.
//! - **Operator Commands**: decommission and move validation.
//! - **Durability**: a restarted Master replays the commit log.

#[cfg(test)]
mod tests {
    use crate::config::{DiscoveryConfig, MasterConfig, NodeConfig};
    use crate::discovery::registry::DiscoveryRegistry;
    use crate::error::ClusterError;
    use crate::master::coordinator::Master;
    use crate::master::log::{FileMapLog, MapLog, MemoryMapLog};
    use crate::master::protocol::ProgressReport;
    use crate::master::types::{MigrationPhase, MigrationProgress};
    use crate::node::agent::NodeAgent;
    use crate::node::types::SlotState;
    use crate::shard::types::{NodeId, TaskId};
    use crate::transport::local::LocalCluster;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Harness {
        cluster: Arc<LocalCluster>,
        master: Arc<Master>,
    }

    impl Harness {
        fn agent(&self, id: u64) -> Arc<NodeAgent> {
            self.cluster.agent(NodeId(id)).unwrap()
        }

        /// Every node but `dead` heartbeats far in the future; `dead` stays silent.
        fn kill(&self, dead: u64) {
            let later = Instant::now() + Duration::from_secs(60);
            for record in self.cluster.registry().list_alive() {
                if record.node_id != NodeId(dead) {
                    self.cluster
                        .registry()
                        .heartbeat_at(record.node_id, later)
                        .unwrap();
                }
            }
            self.cluster.registry().sweep(later);
        }
    }

    fn node_config() -> NodeConfig {
        NodeConfig {
            delta_flush_ms: 2,
            ..NodeConfig::default()
        }
    }

    async fn harness_with(config: MasterConfig, log: Arc<dyn MapLog>, nodes: &[u64]) -> Harness {
        let cluster = LocalCluster::new(DiscoveryRegistry::new(DiscoveryConfig::default()));
        let link = cluster.link(None);
        let master = Master::new(config, link.clone(), link, log).unwrap();
        cluster.set_master(master.clone());

        for id in nodes {
            let agent = cluster.new_node(NodeId(*id), format!("node-{}.test:7200", id), node_config());
            agent.register().await.unwrap();
        }
        Harness { cluster, master }
    }

    async fn harness(shard_count: u32, nodes: &[u64]) -> Harness {
        let config = MasterConfig {
            shard_count,
            ..MasterConfig::default()
        };
        harness_with(config, Arc::new(MemoryMapLog::new()), nodes).await
    }

    async fn drive(master: &Master, tasks: &[TaskId]) {
        for _ in 0..1_000 {
            let mut done = true;
            for task_id in tasks {
                match master.advance(task_id).await {
                    Ok(phase) if !phase.is_terminal() => done = false,
                    _ => {}
                }
            }
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("migrations did not reach a terminal phase");
    }

    // ============================================================
    // BOOTSTRAP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_bootstrap_assigns_round_robin() {
        let h = harness(6, &[1, 2, 3]).await;

        let tasks = h.master.reconcile_once().await.unwrap();
        let map = h.master.get_shard_map();

        assert!(tasks.is_empty());
        assert_eq!(map.version, 1);
        for id in 1..=3 {
            assert_eq!(map.shards_of(NodeId(id)).len(), 2);
            for shard in map.shards_of(NodeId(id)) {
                assert_eq!(h.agent(id).shard_state(shard), Some(SlotState::Stable));
            }
        }
    }

    #[tokio::test]
    async fn test_bootstrap_waits_for_enough_nodes() {
        let config = MasterConfig {
            shard_count: 4,
            bootstrap_min_nodes: 2,
            ..MasterConfig::default()
        };
        let h = harness_with(config, Arc::new(MemoryMapLog::new()), &[1]).await;

        h.master.reconcile_once().await.unwrap();
        assert_eq!(h.master.get_shard_map().version, 0);

        let agent = h.cluster.new_node(NodeId(2), "node-2.test:7200", node_config());
        agent.register().await.unwrap();
        h.master.reconcile_once().await.unwrap();
        assert_eq!(h.master.get_shard_map().version, 1);
    }

    // ============================================================
    // MIGRATION LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_move_shard_commits_and_carries_data() {
        let h = harness(6, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();

        let map = h.master.get_shard_map();
        let (shard, source) = map.route("user:42").unwrap();
        h.agent(source.node_id.0).put("user:42", "alice").unwrap();
        let destination = (1..=3).map(NodeId).find(|n| *n != source.node_id).unwrap();

        let task_id = h.master.move_shard(shard, destination).await.unwrap();
        drive(&h.master, std::slice::from_ref(&task_id)).await;

        let map = h.master.get_shard_map();
        assert_eq!(map.version, 2);
        assert_eq!(map.owner(shard), Some(destination));
        assert_eq!(
            h.master.task(&task_id).await.unwrap().phase,
            MigrationPhase::Committed
        );

        let dest = h.agent(destination.0);
        assert_eq!(dest.get("user:42").unwrap(), Some("alice".to_string()));
        assert_eq!(h.agent(source.node_id.0).shard_state(shard), None);
        assert!(matches!(
            h.agent(source.node_id.0).get("user:42"),
            Err(ClusterError::NotOwner { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_shard_rejects_busy_shard() {
        let h = harness(6, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();
        let owner = h.master.get_shard_map().owner(0).unwrap();
        let other = (1..=3).map(NodeId).find(|n| *n != owner).unwrap();

        h.master.move_shard(0, other).await.unwrap();
        let second = h.master.move_shard(0, other).await;

        assert!(matches!(second, Err(ClusterError::InvalidShardState { .. })));
    }

    #[tokio::test]
    async fn test_move_shard_to_unknown_node() {
        let h = harness(6, &[1, 2]).await;
        h.master.reconcile_once().await.unwrap();

        let result = h.master.move_shard(0, NodeId(9)).await;
        assert_eq!(result, Err(ClusterError::UnknownNode(NodeId(9))));
    }

    #[tokio::test]
    async fn test_move_before_bootstrap() {
        let h = harness(6, &[]).await;
        assert_eq!(
            h.master.move_shard(0, NodeId(1)).await,
            Err(ClusterError::NoShardMap)
        );
    }

    #[tokio::test]
    async fn test_inbound_limit_queues_extra_moves() {
        let config = MasterConfig {
            shard_count: 6,
            max_inbound_migrations: 1,
            ..MasterConfig::default()
        };
        let h = harness_with(config, Arc::new(MemoryMapLog::new()), &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();
        let map = h.master.get_shard_map();
        let shards = map.shards_of(NodeId(1));
        assert_eq!(shards.len(), 2);

        let first = h.master.move_shard(shards[0], NodeId(2)).await.unwrap();
        let second = h.master.move_shard(shards[1], NodeId(2)).await.unwrap();

        assert_eq!(
            h.master.advance(&first).await.unwrap(),
            MigrationPhase::DataCopying
        );
        assert_eq!(
            h.master.advance(&second).await.unwrap(),
            MigrationPhase::Planned
        );
        assert_eq!(
            h.master.advance(&second).await.unwrap(),
            MigrationPhase::Planned
        );

        drive(&h.master, std::slice::from_ref(&first)).await;
        assert_eq!(
            h.master.task(&second).await.unwrap().phase,
            MigrationPhase::Planned
        );

        assert_eq!(
            h.master.advance(&second).await.unwrap(),
            MigrationPhase::DataCopying
        );
        drive(&h.master, std::slice::from_ref(&second)).await;
        assert_eq!(h.master.get_shard_map().version, 3);
        assert_eq!(h.master.get_shard_map().shards_of(NodeId(2)).len(), 4);
    }

    // ============================================================
    // ABORT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_destination_death_aborts_and_keeps_owner() {
        let h = harness(6, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();
        let map = h.master.get_shard_map();
        let (shard, source) = map.route("order:7").unwrap();
        h.agent(source.node_id.0).put("order:7", "paid").unwrap();
        let destination = (1..=3).map(NodeId).find(|n| *n != source.node_id).unwrap();

        let task_id = h.master.move_shard(shard, destination).await.unwrap();
        assert_eq!(
            h.master.advance(&task_id).await.unwrap(),
            MigrationPhase::DataCopying
        );

        h.kill(destination.0);
        h.master.reconcile_once().await.unwrap();

        let task = h.master.task(&task_id).await.unwrap();
        assert_eq!(task.phase, MigrationPhase::Aborted);
        let map = h.master.get_shard_map();
        assert_eq!(map.owner(shard), Some(source.node_id));
        assert_eq!(map.assignment(shard).unwrap().version, 1);

        let src = h.agent(source.node_id.0);
        assert_eq!(src.shard_state(shard), Some(SlotState::Stable));
        assert_eq!(src.get("order:7").unwrap(), Some("paid".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_destination_holds_shard_until_rollback() {
        let h = harness(6, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();
        let owner = h.master.get_shard_map().owner(0).unwrap();
        let destination = (1..=3).map(NodeId).find(|n| *n != owner).unwrap();

        let task_id = h.master.move_shard(0, destination).await.unwrap();
        h.cluster.isolate(destination);

        let result = h.master.advance(&task_id).await;
        assert!(matches!(result, Err(ClusterError::MigrationAborted { .. })));

        let task = h.master.task(&task_id).await.unwrap();
        assert_eq!(task.phase, MigrationPhase::Aborted);
        assert!(task.pending_rollback.contains(&destination));
        assert!(matches!(
            h.master.move_shard(0, destination).await,
            Err(ClusterError::InvalidShardState { .. })
        ));

        h.cluster.heal(destination);
        h.master.reconcile_once().await.unwrap();

        let task = h.master.task(&task_id).await.unwrap();
        assert!(task.pending_rollback.is_empty());
        assert!(h.master.move_shard(0, destination).await.is_ok());
    }

    #[tokio::test]
    async fn test_catch_up_deadline_aborts_stalled_move() {
        let config = MasterConfig {
            shard_count: 4,
            catch_up_timeout_ms: 20,
            ..MasterConfig::default()
        };
        let h = harness_with(config, Arc::new(MemoryMapLog::new()), &[1, 2]).await;
        h.master.reconcile_once().await.unwrap();
        let map = h.master.get_shard_map();
        let (shard, source) = map.route("invoice:3").unwrap();
        let source = source.node_id;
        h.agent(source.0).put("invoice:3", "due").unwrap();
        let destination = [NodeId(1), NodeId(2)]
            .into_iter()
            .find(|n| *n != source)
            .unwrap();

        // The source streams, but its progress never reaches the Master
        h.cluster.block(source, "progress");
        let task_id = h.master.move_shard(shard, destination).await.unwrap();
        assert_eq!(
            h.master.advance(&task_id).await.unwrap(),
            MigrationPhase::DataCopying
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            h.master.advance(&task_id).await.unwrap(),
            MigrationPhase::Aborted
        );

        let task = h.master.task(&task_id).await.unwrap();
        assert_eq!(task.phase, MigrationPhase::Aborted);
        assert!(!task.caught_up);
        assert_eq!(h.master.get_shard_map().version, 1);
        assert_eq!(h.master.get_shard_map().owner(shard), Some(source));

        let src = h.agent(source.0);
        assert_eq!(src.shard_state(shard), Some(SlotState::Stable));
        assert_eq!(src.get("invoice:3").unwrap(), Some("due".to_string()));
        assert_eq!(h.agent(destination.0).shard_state(shard), None);
    }

    #[tokio::test]
    async fn test_unconfirmed_activation_keeps_source_copy() {
        let h = harness(4, &[1, 2]).await;
        h.master.reconcile_once().await.unwrap();
        let map = h.master.get_shard_map();
        let (shard, source) = map.route("cart:5").unwrap();
        let source = source.node_id;
        h.agent(source.0).put("cart:5", "2 items").unwrap();
        let destination = [NodeId(1), NodeId(2)]
            .into_iter()
            .find(|n| *n != source)
            .unwrap();

        h.cluster.block(destination, "activate");
        let task_id = h.master.move_shard(shard, destination).await.unwrap();
        drive(&h.master, std::slice::from_ref(&task_id)).await;

        let map = h.master.get_shard_map();
        assert_eq!(map.version, 2);
        assert_eq!(map.owner(shard), Some(destination));
        assert!(matches!(
            h.agent(destination.0).shard_state(shard),
            Some(SlotState::MigratingIn { .. })
        ));
        // Not released: the retired copy is still there
        assert!(matches!(
            h.agent(source.0).shard_state(shard),
            Some(SlotState::Retired { .. })
        ));
        assert!(matches!(
            h.master.move_shard(shard, source).await,
            Err(ClusterError::InvalidShardState { .. })
        ));

        h.cluster.unblock(destination, "activate");
        h.master.reconcile_once().await.unwrap();

        let dest = h.agent(destination.0);
        assert_eq!(dest.shard_state(shard), Some(SlotState::Stable));
        assert_eq!(dest.get("cart:5").unwrap(), Some("2 items".to_string()));
        assert_eq!(h.agent(source.0).shard_state(shard), None);
        assert!(h.master.move_shard(shard, source).await.is_ok());
    }

    #[tokio::test]
    async fn test_progress_from_non_source_is_rejected() {
        let h = harness(6, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();
        let owner = h.master.get_shard_map().owner(0).unwrap();
        let destination = (1..=3).map(NodeId).find(|n| *n != owner).unwrap();
        let task_id = h.master.move_shard(0, destination).await.unwrap();

        let report = ProgressReport {
            task_id: task_id.clone(),
            shard: 0,
            reporter: destination,
            progress: MigrationProgress::CaughtUp { lag: 0 },
        };
        let result = h.master.report_migration_progress(report).await;

        assert!(matches!(result, Err(ClusterError::InvalidShardState { .. })));
        assert!(!h.master.task(&task_id).await.unwrap().caught_up);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let h = harness(6, &[1]).await;
        let missing = TaskId::new();
        assert_eq!(
            h.master.advance(&missing).await,
            Err(ClusterError::UnknownTask(missing))
        );
    }

    // ============================================================
    // OPERATOR COMMAND TESTS
    // ============================================================

    #[tokio::test]
    async fn test_decommission_drains_and_deregisters() {
        let h = harness(6, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();

        h.master.decommission(NodeId(3)).await.unwrap();
        let tasks = h.master.reconcile_once().await.unwrap();
        assert_eq!(tasks.len(), 2);
        drive(&h.master, &tasks).await;

        h.master.reconcile_once().await.unwrap();

        let map = h.master.get_shard_map();
        assert!(map.shards_of(NodeId(3)).is_empty());
        assert_eq!(map.shards_of(NodeId(1)).len(), 3);
        assert_eq!(map.shards_of(NodeId(2)).len(), 3);
        assert!(h.cluster.registry().get(NodeId(3)).is_none());
    }

    #[tokio::test]
    async fn test_status_reports_members_and_tasks() {
        let h = harness(4, &[1, 2]).await;
        h.master.reconcile_once().await.unwrap();
        let owner = h.master.get_shard_map().owner(1).unwrap();
        let other = [NodeId(1), NodeId(2)]
            .into_iter()
            .find(|n| *n != owner)
            .unwrap();
        h.master.move_shard(1, other).await.unwrap();

        let status = h.master.status().await;

        assert_eq!(status.epoch, h.master.epoch());
        assert_eq!(status.members.len(), 2);
        assert_eq!(status.active.len(), 1);
        assert_eq!(status.map.version, 1);
    }

    // ============================================================
    // DURABILITY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_restarted_master_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.log");
        let config = MasterConfig {
            shard_count: 6,
            ..MasterConfig::default()
        };

        let log = Arc::new(FileMapLog::open(&path).unwrap());
        let h = harness_with(config.clone(), log, &[1, 2, 3]).await;
        h.master.reconcile_once().await.unwrap();
        let owner = h.master.get_shard_map().owner(2).unwrap();
        let destination = (1..=3).map(NodeId).find(|n| *n != owner).unwrap();
        let task_id = h.master.move_shard(2, destination).await.unwrap();
        drive(&h.master, std::slice::from_ref(&task_id)).await;
        let first_epoch = h.master.epoch();

        let link = h.cluster.link(None);
        let reopened = Arc::new(FileMapLog::open(&path).unwrap());
        let restarted = Master::new(config, link.clone(), link, reopened).unwrap();

        let map = restarted.get_shard_map();
        assert_eq!(map.version, 2);
        assert_eq!(map.owner(2), Some(destination));
        assert_ne!(restarted.epoch(), first_epoch);
    }
}
