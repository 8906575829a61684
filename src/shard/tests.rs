//! Shard Model Tests
//!
//! ## Test Scopes
//! - **Bootstrap**: Round-robin placement and version 1.
//! - **Commit**: Version increments once per move, ownership is exclusive.
//! - **Snapshots**: Routing lookups on the read-only copy.

#[cfg(test)]
mod tests {
    use crate::error::ClusterError;
    use crate::shard::map::{MapRecord, ShardMap, ShardMapSnapshot};
    use crate::shard::types::{NodeEndpoint, NodeId, TaskId};

    fn nodes(ids: &[u64]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId(*id)).collect()
    }

    fn bootstrapped(shards: u32, ids: &[u64]) -> ShardMap {
        let mut map = ShardMap::new(shards);
        let record = map.bootstrap_record(&nodes(ids)).unwrap();
        map.apply(&record).unwrap();
        map
    }

    // ============================================================
    // BOOTSTRAP TESTS
    // ============================================================

    #[test]
    fn test_bootstrap_round_robin() {
        let map = bootstrapped(6, &[3, 1, 2]);

        assert_eq!(map.version(), 1);
        assert_eq!(map.shards_of(NodeId(1)), vec![0, 3]);
        assert_eq!(map.shards_of(NodeId(2)), vec![1, 4]);
        assert_eq!(map.shards_of(NodeId(3)), vec![2, 5]);
    }

    #[test]
    fn test_bootstrap_only_once() {
        let map = bootstrapped(4, &[1]);
        assert!(map.bootstrap_record(&nodes(&[1, 2])).is_err());
    }

    #[test]
    fn test_bootstrap_requires_nodes() {
        let map = ShardMap::new(4);
        assert!(map.bootstrap_record(&[]).is_err());
        assert!(!map.is_bootstrapped());
    }

    // ============================================================
    // COMMIT TESTS
    // ============================================================

    #[test]
    fn test_move_bumps_version_once() {
        let mut map = bootstrapped(4, &[1, 2]);
        let task = TaskId::new();

        let record = map.move_record(&task, 0, NodeId(1), NodeId(2)).unwrap();
        map.apply(&record).unwrap();

        assert_eq!(map.version(), 2);
        assert_eq!(map.owner(0), Some(NodeId(2)));
        assert_eq!(map.assignment(0).unwrap().version, 2);
        // Untouched shards keep their grant version
        assert_eq!(map.assignment(1).unwrap().version, 1);
    }

    #[test]
    fn test_move_from_wrong_owner_rejected() {
        let map = bootstrapped(4, &[1, 2]);
        let result = map.move_record(&TaskId::new(), 1, NodeId(1), NodeId(2));

        assert!(matches!(
            result,
            Err(ClusterError::InvalidShardState { shard: 1, .. })
        ));
    }

    #[test]
    fn test_stale_record_rejected() {
        let mut map = bootstrapped(4, &[1, 2]);
        let task = TaskId::new();
        let record = map.move_record(&task, 0, NodeId(1), NodeId(2)).unwrap();
        map.apply(&record).unwrap();

        // Same record again no longer follows the current version
        assert!(map.apply(&record).is_err());
        assert_eq!(map.version(), 2);
    }

    #[test]
    fn test_replay_rebuilds_map() {
        let mut original = ShardMap::new(8);
        let boot = original.bootstrap_record(&nodes(&[1, 2, 3])).unwrap();
        assert!(matches!(boot, MapRecord::Bootstrap { version: 1, .. }));
        original.apply(&boot).unwrap();
        let mut log = vec![boot];

        for (shard, to) in [(0u32, 2u64), (4, 3)] {
            let from = original.owner(shard).unwrap();
            let record = original
                .move_record(&TaskId::new(), shard, from, NodeId(to))
                .unwrap();
            original.apply(&record).unwrap();
            log.push(record);
        }

        let mut replayed = ShardMap::new(8);
        for record in &log {
            replayed.apply(record).unwrap();
        }

        assert_eq!(replayed.version(), original.version());
        assert_eq!(replayed.load(), original.load());
        for shard in 0..8 {
            assert_eq!(replayed.owner(shard), original.owner(shard));
        }
    }

    #[test]
    fn test_every_shard_has_one_owner() {
        let map = bootstrapped(16, &[1, 2, 3, 4, 5]);
        let total: usize = map.load().values().sum();
        assert_eq!(total, 16);
    }

    // ============================================================
    // SNAPSHOT TESTS
    // ============================================================

    #[test]
    fn test_snapshot_routes_to_owner_address() {
        let map = bootstrapped(4, &[1, 2]);
        let snapshot = map.snapshot(
            vec![
                NodeEndpoint::new(NodeId(1), "10.0.0.1:7000"),
                NodeEndpoint::new(NodeId(2), "10.0.0.2:7000"),
            ],
            42,
        );

        let (shard, endpoint) = snapshot.route("user:17").unwrap();
        assert_eq!(snapshot.owner(shard), Some(endpoint.node_id));
        assert_eq!(snapshot.master_epoch, 42);
    }

    #[test]
    fn test_empty_snapshot_cannot_route() {
        let snapshot = ShardMapSnapshot::empty(4, 1);
        assert_eq!(snapshot.route("k"), Err(ClusterError::NoShardMap));
    }

    #[test]
    fn test_snapshot_missing_endpoint() {
        let map = bootstrapped(1, &[5]);
        let snapshot = map.snapshot(vec![], 0);
        assert_eq!(
            snapshot.route("k"),
            Err(ClusterError::UnknownNode(NodeId(5)))
        );
    }
}
