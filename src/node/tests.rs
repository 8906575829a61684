//! Node Module Tests
//!
//! ## Test Scopes
//! - **Data Plane**: ownership checks and `NotOwner` replies.
//! - **Destination Side**: prepare, snapshot install, ordered delta apply, activation.
//! - **Source Side**: streaming, writes during `MigratingOut`, cutover and release.
//! - **Rollback**: abort restores the source and discards the destination copy.
//! - **Map Following**: stale copies, missed activations, Master restarts, rejoin after death.

#[cfg(test)]
mod tests {
    use crate::config::{DiscoveryConfig, NodeConfig};
    use crate::discovery::registry::DiscoveryRegistry;
    use crate::error::ClusterError;
    use crate::node::agent::NodeAgent;
    use crate::node::protocol::*;
    use crate::node::types::{DeltaOp, Mutation, SlotState};
    use crate::shard::map::{ShardMap, ShardMapSnapshot};
    use crate::shard::types::{NodeEndpoint, NodeId, TaskId};
    use crate::transport::local::LocalCluster;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn config() -> NodeConfig {
        NodeConfig {
            delta_flush_ms: 2,
            ..NodeConfig::default()
        }
    }

    fn cluster() -> Arc<LocalCluster> {
        LocalCluster::new(DiscoveryRegistry::new(DiscoveryConfig::default()))
    }

    fn node(cluster: &Arc<LocalCluster>, id: u64) -> Arc<NodeAgent> {
        cluster.new_node(NodeId(id), format!("node-{}.test:7201", id), config())
    }

    /// Single-shard cluster so every key lands on shard 0.
    fn bootstrap(agent: &NodeAgent) {
        agent
            .activate(ActivateRequest {
                task_id: None,
                shard: 0,
                version: 1,
                shard_count: 1,
            })
            .unwrap();
    }

    fn prepare(agent: &NodeAgent, task_id: &TaskId, source: Option<NodeId>) {
        agent
            .prepare_receive(PrepareReceiveRequest {
                task_id: task_id.clone(),
                shard: 0,
                source,
            })
            .unwrap();
        // The destination learns the shard count from its map; mimic that here.
        agent.sync_with_map(&ShardMapSnapshot::empty(1, 0));
    }

    fn put_op(seq: u64, key: &str, value: &str) -> DeltaOp {
        DeltaOp {
            seq,
            mutation: Mutation::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
        }
    }

    fn moved_map(epoch: u64) -> ShardMapSnapshot {
        let mut map = ShardMap::new(1);
        let boot = map.bootstrap_record(&[NodeId(1)]).unwrap();
        map.apply(&boot).unwrap();
        let mv = map
            .move_record(&TaskId::new(), 0, NodeId(1), NodeId(2))
            .unwrap();
        map.apply(&mv).unwrap();
        map.snapshot(
            vec![
                NodeEndpoint::new(NodeId(1), "node-1.test:7201"),
                NodeEndpoint::new(NodeId(2), "node-2.test:7201"),
            ],
            epoch,
        )
    }

    async fn wait_for_entries(agent: &NodeAgent, entries: usize) {
        for _ in 0..500 {
            if agent
                .status()
                .shards
                .first()
                .is_some_and(|s| s.entries == entries)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("destination never reached {} entries", entries);
    }

    // ============================================================
    // DATA PLANE TESTS
    // ============================================================

    #[test]
    fn test_unowned_shard_answers_not_owner() {
        let c = cluster();
        let a = node(&c, 1);

        assert_eq!(
            a.get("k"),
            Err(ClusterError::NotOwner {
                shard: 0,
                current_version: 0
            })
        );
    }

    #[test]
    fn test_stable_shard_serves_reads_and_writes() {
        let c = cluster();
        let a = node(&c, 1);
        bootstrap(&a);

        a.put("k", "v1").unwrap();
        a.put("k", "v2").unwrap();
        assert_eq!(a.get("k").unwrap(), Some("v2".to_string()));
        assert!(a.delete("k").unwrap());
        assert!(!a.delete("k").unwrap());
        assert_eq!(a.get("k").unwrap(), None);
    }

    #[test]
    fn test_bootstrap_activation_is_idempotent() {
        let c = cluster();
        let a = node(&c, 1);
        bootstrap(&a);
        a.put("k", "v").unwrap();
        bootstrap(&a);

        assert_eq!(a.get("k").unwrap(), Some("v".to_string()));
        assert_eq!(a.known_version(), 1);
    }

    // ============================================================
    // DESTINATION SIDE TESTS
    // ============================================================

    #[test]
    fn test_migrating_in_does_not_serve() {
        let c = cluster();
        let b = node(&c, 2);
        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));

        assert!(matches!(b.get("k"), Err(ClusterError::NotOwner { .. })));
        assert!(matches!(b.put("k", "v"), Err(ClusterError::NotOwner { .. })));
    }

    #[test]
    fn test_prepare_is_idempotent_but_refuses_a_second_task() {
        let c = cluster();
        let b = node(&c, 2);
        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));
        prepare(&b, &task, Some(NodeId(1)));

        let other = b.prepare_receive(PrepareReceiveRequest {
            task_id: TaskId::new(),
            shard: 0,
            source: Some(NodeId(1)),
        });
        assert!(matches!(other, Err(ClusterError::InvalidShardState { .. })));
    }

    #[test]
    fn test_delta_applies_in_order_and_skips_duplicates() {
        let c = cluster();
        let b = node(&c, 2);
        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));

        b.install_snapshot(InstallSnapshotRequest {
            task_id: task.clone(),
            shard: 0,
            entries: vec![("a".into(), "1".into())],
        })
        .unwrap();

        let batch = |ops: Vec<DeltaOp>| ApplyDeltaRequest {
            task_id: task.clone(),
            shard: 0,
            ops,
        };
        assert_eq!(
            b.apply_delta(batch(vec![put_op(1, "a", "2"), put_op(2, "b", "1")]))
                .unwrap(),
            2
        );
        // Redelivery after a lost ack
        assert_eq!(
            b.apply_delta(batch(vec![put_op(2, "b", "stale"), put_op(3, "c", "1")]))
                .unwrap(),
            3
        );
        assert!(matches!(
            b.apply_delta(batch(vec![put_op(5, "d", "1")])),
            Err(ClusterError::InvalidShardState { .. })
        ));

        b.activate(ActivateRequest {
            task_id: Some(task),
            shard: 0,
            version: 2,
            shard_count: 1,
        })
        .unwrap();

        assert_eq!(b.get("a").unwrap(), Some("2".to_string()));
        assert_eq!(b.get("b").unwrap(), Some("1".to_string()));
        assert_eq!(b.get("d").unwrap(), None);
    }

    #[test]
    fn test_snapshot_for_another_task_is_refused() {
        let c = cluster();
        let b = node(&c, 2);
        prepare(&b, &TaskId::new(), Some(NodeId(1)));

        let result = b.install_snapshot(InstallSnapshotRequest {
            task_id: TaskId::new(),
            shard: 0,
            entries: vec![],
        });
        assert!(matches!(result, Err(ClusterError::InvalidShardState { .. })));
    }

    // ============================================================
    // SOURCE SIDE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_stream_carries_snapshot_and_concurrent_writes() {
        let c = cluster();
        let a = node(&c, 1);
        let b = node(&c, 2);
        bootstrap(&a);
        a.put("before", "1").unwrap();

        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));
        a.begin_snapshot_transfer(BeginTransferRequest {
            task_id: task.clone(),
            shard: 0,
            destination: b.endpoint().clone(),
        })
        .unwrap();

        // Still served while migrating out; the write goes to the delta log too
        a.put("during", "2").unwrap();
        assert_eq!(a.get("before").unwrap(), Some("1".to_string()));
        wait_for_entries(&b, 2).await;

        let ack = a
            .cutover(CutoverRequest {
                task_id: task.clone(),
                shard: 0,
            })
            .await
            .unwrap();
        assert_eq!(ack.final_seq, 1);
        assert!(matches!(
            a.put("after", "3"),
            Err(ClusterError::NotOwner { .. })
        ));

        b.activate(ActivateRequest {
            task_id: Some(task.clone()),
            shard: 0,
            version: 2,
            shard_count: 1,
        })
        .unwrap();
        a.release(ReleaseRequest {
            task_id: task,
            shard: 0,
            version: 2,
        })
        .unwrap();

        assert_eq!(b.get("before").unwrap(), Some("1".to_string()));
        assert_eq!(b.get("during").unwrap(), Some("2".to_string()));
        assert_eq!(a.shard_state(0), None);
        assert_eq!(a.known_version(), 2);
    }

    #[tokio::test]
    async fn test_cutover_flushes_trailing_writes() {
        let c = cluster();
        let a = node(&c, 1);
        let b = node(&c, 2);
        bootstrap(&a);

        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));
        a.begin_snapshot_transfer(BeginTransferRequest {
            task_id: task.clone(),
            shard: 0,
            destination: b.endpoint().clone(),
        })
        .unwrap();
        for i in 0..20 {
            a.put(&format!("k{}", i), "v").unwrap();
        }

        a.cutover(CutoverRequest {
            task_id: task.clone(),
            shard: 0,
        })
        .await
        .unwrap();

        assert_eq!(b.status().shards[0].entries, 20);
    }

    #[test]
    fn test_release_requires_retired_slot() {
        let c = cluster();
        let a = node(&c, 1);
        bootstrap(&a);
        let req = || ReleaseRequest {
            task_id: TaskId::new(),
            shard: 0,
            version: 2,
        };

        assert!(matches!(
            a.release(req()),
            Err(ClusterError::InvalidShardState { .. })
        ));

        let empty = node(&c, 3);
        assert!(empty.release(req()).is_ok());
    }

    // ============================================================
    // ROLLBACK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_abort_restores_source_and_discards_destination() {
        let c = cluster();
        let a = node(&c, 1);
        let b = node(&c, 2);
        bootstrap(&a);
        a.put("k", "v").unwrap();

        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));
        a.begin_snapshot_transfer(BeginTransferRequest {
            task_id: task.clone(),
            shard: 0,
            destination: b.endpoint().clone(),
        })
        .unwrap();
        a.cutover(CutoverRequest {
            task_id: task.clone(),
            shard: 0,
        })
        .await
        .unwrap();

        let abort = AbortRequest {
            task_id: task,
            shard: 0,
        };
        a.abort_migration(abort.clone()).unwrap();
        b.abort_migration(abort.clone()).unwrap();
        a.abort_migration(abort).unwrap();

        assert_eq!(a.shard_state(0), Some(SlotState::Stable));
        assert_eq!(a.get("k").unwrap(), Some("v".to_string()));
        assert_eq!(b.shard_state(0), None);
    }

    #[test]
    fn test_abort_for_another_task_is_ignored() {
        let c = cluster();
        let b = node(&c, 2);
        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));

        b.abort_migration(AbortRequest {
            task_id: TaskId::new(),
            shard: 0,
        })
        .unwrap();

        assert!(matches!(
            b.shard_state(0),
            Some(SlotState::MigratingIn { .. })
        ));
    }

    // ============================================================
    // MAP FOLLOWING TESTS
    // ============================================================

    #[test]
    fn test_sync_drops_stable_copy_granted_elsewhere() {
        let c = cluster();
        let a = node(&c, 1);
        bootstrap(&a);
        a.put("k", "v").unwrap();

        a.sync_with_map(&moved_map(7));

        assert_eq!(a.shard_state(0), None);
        assert_eq!(
            a.get("k"),
            Err(ClusterError::NotOwner {
                shard: 0,
                current_version: 2
            })
        );
    }

    #[test]
    fn test_sync_repairs_missed_activation() {
        let c = cluster();
        let b = node(&c, 2);
        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));

        b.sync_with_map(&moved_map(7));

        assert_eq!(b.shard_state(0), Some(SlotState::Stable));
        assert_eq!(b.get("k").unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_master_epoch_rolls_back_outgoing_migration() {
        let c = cluster();
        let a = node(&c, 1);
        let b = node(&c, 2);
        bootstrap(&a);

        let mut map = ShardMap::new(1);
        let boot = map.bootstrap_record(&[NodeId(1)]).unwrap();
        map.apply(&boot).unwrap();
        a.sync_with_map(&map.snapshot(vec![], 7));

        let task = TaskId::new();
        prepare(&b, &task, Some(NodeId(1)));
        a.begin_snapshot_transfer(BeginTransferRequest {
            task_id: task,
            shard: 0,
            destination: b.endpoint().clone(),
        })
        .unwrap();

        a.sync_with_map(&map.snapshot(vec![], 8));

        assert_eq!(a.shard_state(0), Some(SlotState::Stable));
        assert!(a.put("k", "v").is_ok());
    }

    #[tokio::test]
    async fn test_rejoin_after_death_discards_everything() {
        let c = cluster();
        let a = node(&c, 1);
        a.register().await.unwrap();
        bootstrap(&a);
        a.put("k", "v").unwrap();

        c.registry().sweep(Instant::now() + Duration::from_secs(60));
        a.heartbeat_once().await.unwrap();

        assert_eq!(a.shard_state(0), None);
        assert!(matches!(a.get("k"), Err(ClusterError::NotOwner { .. })));
        assert!(c.registry().get(NodeId(1)).unwrap().state.is_live());
    }
}
