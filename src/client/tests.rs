//! Client Module Tests
//!
//! ## Test Scopes
//! - **Routing**: reads and writes reach the owner named by the cached map.
//! - **Staleness**: a moved shard costs one redirect and one refresh.
//! - **Retry Budget**: an unreachable owner surfaces `RetriesExhausted`.
//! - **Cache Monotonicity**: an older map never replaces a newer one.
//! - **Bulk Load**: `key,value` files.

#[cfg(test)]
mod tests {
    use crate::client::router::ClientRouter;
    use crate::config::{ClientConfig, DiscoveryConfig, MasterConfig, NodeConfig};
    use crate::discovery::registry::DiscoveryRegistry;
    use crate::error::{ClusterError, ClusterResult};
    use crate::master::coordinator::Master;
    use crate::master::log::MemoryMapLog;
    use crate::master::protocol::ProgressReport;
    use crate::master::types::MigrationPhase;
    use crate::shard::map::{ShardMap, ShardMapSnapshot};
    use crate::shard::types::{NodeEndpoint, NodeId, TaskId};
    use crate::transport::MasterApi;
    use crate::transport::local::LocalCluster;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn client_config() -> ClientConfig {
        ClientConfig {
            max_attempts: 2,
            backoff_initial_ms: 1,
            backoff_max_ms: 4,
        }
    }

    async fn cluster(shard_count: u32, nodes: &[u64]) -> (Arc<LocalCluster>, Arc<Master>) {
        let cluster = LocalCluster::new(DiscoveryRegistry::new(DiscoveryConfig::default()));
        let link = cluster.link(None);
        let config = MasterConfig {
            shard_count,
            ..MasterConfig::default()
        };
        let master = Master::new(config, link.clone(), link, Arc::new(MemoryMapLog::new())).unwrap();
        cluster.set_master(master.clone());

        let node_config = NodeConfig {
            delta_flush_ms: 2,
            ..NodeConfig::default()
        };
        for id in nodes {
            let agent =
                cluster.new_node(NodeId(*id), format!("node-{}.test:7201", id), node_config.clone());
            agent.register().await.unwrap();
        }
        master.reconcile_once().await.unwrap();
        (cluster, master)
    }

    async fn client(cluster: &Arc<LocalCluster>) -> ClientRouter {
        let link = cluster.link(None);
        ClientRouter::connect(link.clone(), link, client_config())
            .await
            .unwrap()
    }

    async fn finish(master: &Master, task_id: &TaskId) {
        for _ in 0..1_000 {
            if master.advance(task_id).await.unwrap() == MigrationPhase::Committed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("move did not commit");
    }

    /// Serves whatever map the test sets.
    struct FixedMaster {
        map: Mutex<ShardMapSnapshot>,
    }

    #[async_trait]
    impl MasterApi for FixedMaster {
        async fn get_shard_map(&self) -> ClusterResult<ShardMapSnapshot> {
            Ok(self.map.lock().unwrap().clone())
        }

        async fn report_migration_progress(&self, _report: ProgressReport) -> ClusterResult<()> {
            Ok(())
        }
    }

    fn map_at(version_bumps: usize) -> ShardMapSnapshot {
        let mut map = ShardMap::new(2);
        let boot = map.bootstrap_record(&[NodeId(1), NodeId(2)]).unwrap();
        map.apply(&boot).unwrap();
        for i in 0..version_bumps {
            let (from, to) = if i % 2 == 0 {
                (NodeId(1), NodeId(2))
            } else {
                (NodeId(2), NodeId(1))
            };
            let mv = map.move_record(&TaskId::new(), 0, from, to).unwrap();
            map.apply(&mv).unwrap();
        }
        map.snapshot(
            vec![
                NodeEndpoint::new(NodeId(1), "a"),
                NodeEndpoint::new(NodeId(2), "b"),
            ],
            1,
        )
    }

    // ============================================================
    // ROUTING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_connect_requires_a_committed_map() {
        let (cluster, _master) = cluster(4, &[]).await;
        let link = cluster.link(None);

        let result = ClientRouter::connect(link.clone(), link, client_config()).await;
        assert!(matches!(result, Err(ClusterError::NoShardMap)));
    }

    #[tokio::test]
    async fn test_put_get_delete_through_router() {
        let (cluster, _master) = cluster(8, &[1, 2, 3]).await;
        let client = client(&cluster).await;

        for i in 0..30 {
            client.put(&format!("key-{}", i), &i.to_string()).await.unwrap();
        }
        for i in 0..30 {
            assert_eq!(
                client.get(&format!("key-{}", i)).await.unwrap(),
                Some(i.to_string())
            );
        }
        assert!(client.delete("key-3").await.unwrap());
        assert_eq!(client.get("key-3").await.unwrap(), None);
        assert_eq!(client.stats().redirects, 0);
    }

    // ============================================================
    // STALENESS TESTS
    // ============================================================

    #[tokio::test]
    async fn test_moved_shard_costs_one_redirect() {
        let (cluster, master) = cluster(6, &[1, 2, 3]).await;
        let client = client(&cluster).await;
        client.put("cart:9", "3 items").await.unwrap();

        let (shard, owner) = client.route("cart:9").unwrap();
        let destination = (1..=3).map(NodeId).find(|n| *n != owner.node_id).unwrap();
        let task_id = master.move_shard(shard, destination).await.unwrap();
        finish(&master, &task_id).await;

        assert_eq!(client.cached_map().version, 1);
        assert_eq!(
            client.get("cart:9").await.unwrap(),
            Some("3 items".to_string())
        );

        let stats = client.stats();
        assert_eq!(stats.redirects, 1);
        assert_eq!(stats.refreshes, 1);
        assert_eq!(client.cached_map().version, 2);
    }

    // ============================================================
    // RETRY BUDGET TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unreachable_owner_exhausts_retries() {
        let (cluster, _master) = cluster(4, &[1, 2]).await;
        let client = client(&cluster).await;
        let (_, owner) = client.route("k").unwrap();
        cluster.isolate(owner.node_id);

        let result = client.get("k").await;

        match result {
            Err(ClusterError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, ClusterError::Transport(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(client.stats().retries, 1);
    }

    // ============================================================
    // CACHE MONOTONICITY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_refresh_never_goes_backwards() {
        let master = Arc::new(FixedMaster {
            map: Mutex::new(map_at(2)),
        });
        let cluster = LocalCluster::new(DiscoveryRegistry::new(DiscoveryConfig::default()));
        let client = ClientRouter::connect(master.clone(), cluster.link(None), client_config())
            .await
            .unwrap();
        assert_eq!(client.cached_map().version, 3);

        *master.map.lock().unwrap() = map_at(0);
        assert_eq!(client.refresh().await.unwrap(), 3);

        *master.map.lock().unwrap() = map_at(3);
        assert_eq!(client.refresh().await.unwrap(), 4);
    }

    // ============================================================
    // BULK LOAD TESTS
    // ============================================================

    #[tokio::test]
    async fn test_load_file() {
        let (cluster, _master) = cluster(4, &[1, 2]).await;
        let client = client(&cluster).await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file, "alice, admin").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "bob,viewer").unwrap();

        assert_eq!(client.load_file(file.path()).await.unwrap(), 2);
        assert_eq!(client.get("alice").await.unwrap(), Some("admin".to_string()));
        assert_eq!(client.get("bob").await.unwrap(), Some("viewer".to_string()));
    }

    #[tokio::test]
    async fn test_load_file_rejects_malformed_line() {
        let (cluster, _master) = cluster(4, &[1]).await;
        let client = client(&cluster).await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no-separator").unwrap();

        assert!(matches!(
            client.load_file(file.path()).await,
            Err(ClusterError::Storage(_))
        ));
    }
}
