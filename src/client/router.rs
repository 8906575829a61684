use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::shard::map::ShardMapSnapshot;
use crate::shard::types::{MapVersion, NodeEndpoint, ShardId};
use crate::transport::{MasterApi, NodeApi};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientStats {
    /// `NotOwner` replies received.
    pub redirects: u64,
    /// Map fetches after the initial one.
    pub refreshes: u64,
    pub retries: u64,
}

/// Routes each key to its owner using a cached map.
///
/// The cache is refreshed only when a node says it is stale (`NotOwner`) or
/// unreachable, and never moves to an older version.
pub struct ClientRouter {
    master: Arc<dyn MasterApi>,
    nodes: Arc<dyn NodeApi>,
    config: ClientConfig,
    cache: RwLock<Arc<ShardMapSnapshot>>,
    redirects: AtomicU64,
    refreshes: AtomicU64,
    retries: AtomicU64,
}

impl ClientRouter {
    /// Fetches the current map. Fails with `NoShardMap` before the first commit.
    pub async fn connect(
        master: Arc<dyn MasterApi>,
        nodes: Arc<dyn NodeApi>,
        config: ClientConfig,
    ) -> ClusterResult<Self> {
        let snapshot = master.get_shard_map().await?;
        if snapshot.version == 0 {
            return Err(ClusterError::NoShardMap);
        }
        tracing::debug!(version = snapshot.version, "Client connected");

        Ok(Self {
            master,
            nodes,
            config,
            cache: RwLock::new(Arc::new(snapshot)),
            redirects: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    pub fn cached_map(&self) -> Arc<ShardMapSnapshot> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn route(&self, key: &str) -> ClusterResult<(ShardId, NodeEndpoint)> {
        self.cached_map().route(key)
    }

    /// Pulls the latest map and returns the cached version afterwards.
    pub async fn refresh(&self) -> ClusterResult<MapVersion> {
        let fresh = self.master.get_shard_map().await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if fresh.version > cache.version {
            tracing::debug!(from = cache.version, to = fresh.version, "Shard map refreshed");
            *cache = Arc::new(fresh);
        }
        Ok(cache.version)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            redirects: self.redirects.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    pub async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        self.with_routing(key, |node| async move { self.nodes.get(&node, key).await })
            .await
    }

    pub async fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.with_routing(key, |node| async move {
            self.nodes.put(&node, key, value).await
        })
        .await
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> ClusterResult<bool> {
        self.with_routing(key, |node| async move { self.nodes.delete(&node, key).await })
            .await
    }

    /// Loads `key,value` lines into the cluster. Blank lines and `#` comments are skipped.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> ClusterResult<usize> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ClusterError::Storage(format!("{}: {}", path.display(), e)))?;

        let mut loaded = 0;
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(',') else {
                return Err(ClusterError::Storage(format!(
                    "{}:{}: expected `key,value`",
                    path.display(),
                    idx + 1
                )));
            };
            self.put(key.trim(), value.trim()).await?;
            loaded += 1;
        }

        tracing::info!(path = %path.display(), loaded, "Loaded key file");
        Ok(loaded)
    }

    /// Runs `call` against the key's owner, refreshing the map and retrying on
    /// staleness or unreachability until `max_attempts` is spent.
    async fn with_routing<T, F, Fut>(&self, key: &str, call: F) -> ClusterResult<T>
    where
        F: Fn(NodeEndpoint) -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay_ms = self.config.backoff_initial_ms;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match self.route(key) {
                Ok((_, node)) => match call(node).await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_retryable() => e,
                    Err(e) => return Err(e),
                },
                Err(e) => e,
            };

            if let ClusterError::NotOwner {
                shard,
                current_version,
            } = &error
            {
                self.redirects.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, shard, current_version, "Redirected by stale owner");
            }
            if attempts >= max_attempts {
                return Err(ClusterError::RetriesExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }
            self.retries.fetch_add(1, Ordering::Relaxed);

            let before = self.cached_map().version;
            let advanced = match self.refresh().await {
                Ok(version) => version > before,
                Err(e) => {
                    tracing::debug!(error = %e, "Map refresh failed");
                    false
                }
            };
            if !advanced {
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(self.config.backoff_max_ms);
            }
        }
    }
}
