use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::coordinator::Master;
use super::protocol::*;
use super::types::MasterStatus;
use crate::error::ApiResponse;
use crate::shard::map::ShardMapSnapshot;
use crate::transport::http::reply;

pub fn router(master: Arc<Master>) -> Router {
    Router::new()
        .route(ENDPOINT_SHARD_MAP, get(handle_get_shard_map))
        .route(ENDPOINT_PROGRESS, post(handle_progress))
        .route(ENDPOINT_STATUS, get(handle_status))
        .route(ENDPOINT_MOVE_SHARD, post(handle_move_shard))
        .route(ENDPOINT_DECOMMISSION, post(handle_decommission))
        .route(ENDPOINT_REBALANCE, post(handle_rebalance))
        .layer(Extension(master))
}

pub async fn handle_get_shard_map(
    Extension(master): Extension<Arc<Master>>,
) -> (StatusCode, Json<ApiResponse<ShardMapSnapshot>>) {
    reply(Ok(master.get_shard_map().as_ref().clone()))
}

pub async fn handle_progress(
    Extension(master): Extension<Arc<Master>>,
    Json(report): Json<ProgressReport>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(master.report_migration_progress(report).await)
}

pub async fn handle_status(
    Extension(master): Extension<Arc<Master>>,
) -> (StatusCode, Json<ApiResponse<MasterStatus>>) {
    reply(Ok(master.status().await))
}

pub async fn handle_move_shard(
    Extension(master): Extension<Arc<Master>>,
    Json(req): Json<MoveShardRequest>,
) -> (StatusCode, Json<ApiResponse<MoveShardResponse>>) {
    let result = master.move_shard(req.shard, req.destination).await;
    if let Ok(task_id) = &result {
        master.spawn_driver(task_id.clone());
    }
    reply(result.map(|task_id| MoveShardResponse { task_id }))
}

pub async fn handle_decommission(
    Extension(master): Extension<Arc<Master>>,
    Json(req): Json<DecommissionRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(master.decommission(req.node_id).await)
}

pub async fn handle_rebalance(
    Extension(master): Extension<Arc<Master>>,
) -> (StatusCode, Json<ApiResponse<RebalanceResponse>>) {
    let result = master.request_rebalance().await;
    if let Ok(tasks) = &result {
        for task_id in tasks {
            master.spawn_driver(task_id.clone());
        }
    }
    reply(result.map(|tasks| RebalanceResponse { tasks }))
}
