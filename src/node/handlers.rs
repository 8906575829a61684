use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::agent::NodeAgent;
use super::protocol::*;
use super::types::NodeStatus;
use crate::error::ApiResponse;
use crate::transport::http::reply;

pub fn router(agent: Arc<NodeAgent>) -> Router {
    Router::new()
        .route(ENDPOINT_GET, post(handle_get))
        .route(ENDPOINT_PUT, post(handle_put))
        .route(ENDPOINT_DELETE, post(handle_delete))
        .route(ENDPOINT_PREPARE_RECEIVE, post(handle_prepare_receive))
        .route(ENDPOINT_BEGIN_TRANSFER, post(handle_begin_transfer))
        .route(ENDPOINT_INSTALL_SNAPSHOT, post(handle_install_snapshot))
        .route(ENDPOINT_APPLY_DELTA, post(handle_apply_delta))
        .route(ENDPOINT_CUTOVER, post(handle_cutover))
        .route(ENDPOINT_ACTIVATE, post(handle_activate))
        .route(ENDPOINT_RELEASE, post(handle_release))
        .route(ENDPOINT_ABORT, post(handle_abort))
        .route(ENDPOINT_STATUS, get(handle_status))
        .layer(Extension(agent))
}

// --- Data plane ---

pub async fn handle_get(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<KeyRequest>,
) -> (StatusCode, Json<ApiResponse<GetResponse>>) {
    reply(agent.get(&req.key).map(|value| GetResponse { value }))
}

pub async fn handle_put(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(agent.put(&req.key, &req.value))
}

pub async fn handle_delete(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<KeyRequest>,
) -> (StatusCode, Json<ApiResponse<DeleteResponse>>) {
    reply(agent.delete(&req.key).map(|existed| DeleteResponse { existed }))
}

// --- Migration plane ---

pub async fn handle_prepare_receive(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<PrepareReceiveRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(agent.prepare_receive(req))
}

pub async fn handle_begin_transfer(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<BeginTransferRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(agent.begin_snapshot_transfer(req))
}

pub async fn handle_install_snapshot(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<InstallSnapshotRequest>,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    reply(agent.install_snapshot(req))
}

pub async fn handle_apply_delta(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<ApplyDeltaRequest>,
) -> (StatusCode, Json<ApiResponse<ApplyDeltaResponse>>) {
    reply(
        agent
            .apply_delta(req)
            .map(|applied_seq| ApplyDeltaResponse { applied_seq }),
    )
}

pub async fn handle_cutover(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<CutoverRequest>,
) -> (StatusCode, Json<ApiResponse<CutoverAck>>) {
    reply(agent.cutover(req).await)
}

pub async fn handle_activate(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<ActivateRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(agent.activate(req))
}

pub async fn handle_release(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<ReleaseRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(agent.release(req))
}

pub async fn handle_abort(
    Extension(agent): Extension<Arc<NodeAgent>>,
    Json(req): Json<AbortRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(agent.abort_migration(req))
}

pub async fn handle_status(
    Extension(agent): Extension<Arc<NodeAgent>>,
) -> (StatusCode, Json<ApiResponse<NodeStatus>>) {
    reply(Ok(agent.status()))
}
