//! HTTP transport.
//!
//! Every role serves an axum router and calls its peers with reqwest. Replies
//! are `ApiResponse` JSON, so a typed `ClusterError` survives the hop.

use async_trait::async_trait;
use axum::{Json, http::StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{DiscoveryApi, MasterApi, NodeApi};
use crate::config::ClusterSection;
use crate::discovery::protocol::{
    DeregisterRequest, ENDPOINT_ALIVE, ENDPOINT_DEREGISTER, ENDPOINT_HEARTBEAT,
    ENDPOINT_REGISTER, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
};
use crate::discovery::types::{NodeRecord, RegisterOutcome};
use crate::error::{ApiResponse, ClusterError, ClusterResult};
use crate::master::protocol::{
    DecommissionRequest, ENDPOINT_DECOMMISSION, ENDPOINT_MOVE_SHARD, ENDPOINT_PROGRESS,
    ENDPOINT_REBALANCE, ENDPOINT_SHARD_MAP, ENDPOINT_STATUS as ENDPOINT_MASTER_STATUS,
    MoveShardRequest, MoveShardResponse, ProgressReport, RebalanceResponse,
};
use crate::master::types::MasterStatus;
use crate::node::protocol::*;
use crate::node::types::NodeStatus;
use crate::shard::map::ShardMapSnapshot;
use crate::shard::types::{NodeEndpoint, NodeId, ShardId, TaskId};

/// Turns a handler result into a status code plus `ApiResponse` body.
pub fn reply<T>(result: ClusterResult<T>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(value) => (StatusCode::OK, Json(ApiResponse::ok(value))),
        Err(e) => (e.http_status(), Json(ApiResponse::err(e))),
    }
}

/// Shared reqwest client with the retry policy every role uses.
///
/// Only failures to get a response are retried here; a reply carrying a
/// `ClusterError` is returned as is and left to the caller's own policy.
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpTransport {
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn from_config(cluster: &ClusterSection) -> Self {
        Self::new(cluster.request_timeout(), cluster.request_attempts)
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        url: &str,
        payload: &T,
    ) -> ClusterResult<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url)
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(transport_error(url, e));
                    }
                    tracing::debug!(url, attempt, error = %e, "Request failed, retrying");
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(ClusterError::Transport(format!("{}: retry attempts exhausted", url)))
    }

    async fn get_with_retry(&self, url: &str) -> ClusterResult<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .get(url)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(transport_error(url, e));
                    }
                    tracing::debug!(url, attempt, error = %e, "Request failed, retrying");
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(ClusterError::Transport(format!("{}: retry attempts exhausted", url)))
    }

    pub async fn call<Req, Resp>(&self, url: &str, payload: &Req) -> ClusterResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self.post_with_retry(url, payload).await?;
        decode(url, response).await
    }

    pub async fn fetch<Resp: DeserializeOwned>(&self, url: &str) -> ClusterResult<Resp> {
        let response = self.get_with_retry(url).await?;
        decode(url, response).await
    }
}

async fn decode<Resp: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> ClusterResult<Resp> {
    let status = response.status();
    response
        .json::<ApiResponse<Resp>>()
        .await
        .map_err(|e| ClusterError::Transport(format!("{} replied {}: {}", url, status, e)))?
        .into_result()
}

fn transport_error(url: &str, e: reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        ClusterError::timeout(url)
    } else {
        ClusterError::Transport(format!("{}: {}", url, e))
    }
}

fn base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

// --- Discovery ---

pub struct HttpDiscoveryClient {
    base_url: String,
    transport: HttpTransport,
}

impl HttpDiscoveryClient {
    pub fn new(base_url: &str, transport: HttpTransport) -> Self {
        Self {
            base_url: base(base_url),
            transport,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl DiscoveryApi for HttpDiscoveryClient {
    async fn register(
        &self,
        node_id: NodeId,
        address: &str,
        boot_id: &str,
    ) -> ClusterResult<RegisterOutcome> {
        let req = RegisterRequest {
            node_id,
            address: address.to_string(),
            boot_id: boot_id.to_string(),
        };
        self.transport.call(&self.url(ENDPOINT_REGISTER), &req).await
    }

    async fn heartbeat(&self, node_id: NodeId) -> ClusterResult<u64> {
        let resp: HeartbeatResponse = self
            .transport
            .call(&self.url(ENDPOINT_HEARTBEAT), &HeartbeatRequest { node_id })
            .await?;
        Ok(resp.incarnation)
    }

    async fn list_alive(&self) -> ClusterResult<Vec<NodeRecord>> {
        self.transport.fetch(&self.url(ENDPOINT_ALIVE)).await
    }

    async fn deregister(&self, node_id: NodeId) -> ClusterResult<()> {
        self.transport
            .call(&self.url(ENDPOINT_DEREGISTER), &DeregisterRequest { node_id })
            .await
    }
}

// --- Master ---

pub struct HttpMasterClient {
    base_url: String,
    transport: HttpTransport,
}

impl HttpMasterClient {
    pub fn new(base_url: &str, transport: HttpTransport) -> Self {
        Self {
            base_url: base(base_url),
            transport,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    pub async fn status(&self) -> ClusterResult<MasterStatus> {
        self.transport.fetch(&self.url(ENDPOINT_MASTER_STATUS)).await
    }

    pub async fn move_shard(&self, shard: ShardId, destination: NodeId) -> ClusterResult<TaskId> {
        let resp: MoveShardResponse = self
            .transport
            .call(
                &self.url(ENDPOINT_MOVE_SHARD),
                &MoveShardRequest { shard, destination },
            )
            .await?;
        Ok(resp.task_id)
    }

    pub async fn decommission(&self, node_id: NodeId) -> ClusterResult<()> {
        self.transport
            .call(
                &self.url(ENDPOINT_DECOMMISSION),
                &DecommissionRequest { node_id },
            )
            .await
    }

    pub async fn rebalance(&self) -> ClusterResult<Vec<TaskId>> {
        let resp: RebalanceResponse = self
            .transport
            .call(&self.url(ENDPOINT_REBALANCE), &())
            .await?;
        Ok(resp.tasks)
    }
}

#[async_trait]
impl MasterApi for HttpMasterClient {
    async fn get_shard_map(&self) -> ClusterResult<ShardMapSnapshot> {
        self.transport.fetch(&self.url(ENDPOINT_SHARD_MAP)).await
    }

    async fn report_migration_progress(&self, report: ProgressReport) -> ClusterResult<()> {
        self.transport
            .call(&self.url(ENDPOINT_PROGRESS), &report)
            .await
    }
}

// --- Nodes ---

/// Reaches any node by the address in its `NodeEndpoint`.
pub struct HttpNodeClient {
    transport: HttpTransport,
}

impl HttpNodeClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn url(node: &NodeEndpoint, endpoint: &str) -> String {
        format!("http://{}{}", node.address, endpoint)
    }
}

#[async_trait]
impl NodeApi for HttpNodeClient {
    async fn get(&self, node: &NodeEndpoint, key: &str) -> ClusterResult<Option<String>> {
        let req = KeyRequest {
            key: key.to_string(),
        };
        let resp: GetResponse = self.transport.call(&Self::url(node, ENDPOINT_GET), &req).await?;
        Ok(resp.value)
    }

    async fn put(&self, node: &NodeEndpoint, key: &str, value: &str) -> ClusterResult<()> {
        let req = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.transport.call(&Self::url(node, ENDPOINT_PUT), &req).await
    }

    async fn delete(&self, node: &NodeEndpoint, key: &str) -> ClusterResult<bool> {
        let req = KeyRequest {
            key: key.to_string(),
        };
        let resp: DeleteResponse = self
            .transport
            .call(&Self::url(node, ENDPOINT_DELETE), &req)
            .await?;
        Ok(resp.existed)
    }

    async fn prepare_receive(
        &self,
        node: &NodeEndpoint,
        req: PrepareReceiveRequest,
    ) -> ClusterResult<()> {
        self.transport
            .call(&Self::url(node, ENDPOINT_PREPARE_RECEIVE), &req)
            .await
    }

    async fn begin_snapshot_transfer(
        &self,
        node: &NodeEndpoint,
        req: BeginTransferRequest,
    ) -> ClusterResult<()> {
        self.transport
            .call(&Self::url(node, ENDPOINT_BEGIN_TRANSFER), &req)
            .await
    }

    async fn install_snapshot(
        &self,
        node: &NodeEndpoint,
        req: InstallSnapshotRequest,
    ) -> ClusterResult<usize> {
        self.transport
            .call(&Self::url(node, ENDPOINT_INSTALL_SNAPSHOT), &req)
            .await
    }

    async fn apply_delta(
        &self,
        node: &NodeEndpoint,
        req: ApplyDeltaRequest,
    ) -> ClusterResult<u64> {
        let resp: ApplyDeltaResponse = self
            .transport
            .call(&Self::url(node, ENDPOINT_APPLY_DELTA), &req)
            .await?;
        Ok(resp.applied_seq)
    }

    async fn cutover(&self, node: &NodeEndpoint, req: CutoverRequest) -> ClusterResult<CutoverAck> {
        self.transport
            .call(&Self::url(node, ENDPOINT_CUTOVER), &req)
            .await
    }

    async fn activate(&self, node: &NodeEndpoint, req: ActivateRequest) -> ClusterResult<()> {
        self.transport
            .call(&Self::url(node, ENDPOINT_ACTIVATE), &req)
            .await
    }

    async fn release(&self, node: &NodeEndpoint, req: ReleaseRequest) -> ClusterResult<()> {
        self.transport
            .call(&Self::url(node, ENDPOINT_RELEASE), &req)
            .await
    }

    async fn abort_migration(&self, node: &NodeEndpoint, req: AbortRequest) -> ClusterResult<()> {
        self.transport
            .call(&Self::url(node, ENDPOINT_ABORT), &req)
            .await
    }

    async fn status(&self, node: &NodeEndpoint) -> ClusterResult<NodeStatus> {
        self.transport
            .fetch(&Self::url(node, ENDPOINT_STATUS))
            .await
    }
}
