use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::protocol::*;
use super::registry::DiscoveryRegistry;
use super::types::{NodeRecord, RegisterOutcome};
use crate::error::ApiResponse;
use crate::transport::http::reply;

pub fn router(registry: Arc<DiscoveryRegistry>) -> Router {
    Router::new()
        .route(ENDPOINT_REGISTER, post(handle_register))
        .route(ENDPOINT_HEARTBEAT, post(handle_heartbeat))
        .route(ENDPOINT_ALIVE, get(handle_list_alive))
        .route(ENDPOINT_DEREGISTER, post(handle_deregister))
        .layer(Extension(registry))
}

pub async fn handle_register(
    Extension(registry): Extension<Arc<DiscoveryRegistry>>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<ApiResponse<RegisterOutcome>>) {
    reply(registry.register(req.node_id, &req.address, &req.boot_id))
}

pub async fn handle_heartbeat(
    Extension(registry): Extension<Arc<DiscoveryRegistry>>,
    Json(req): Json<HeartbeatRequest>,
) -> (StatusCode, Json<ApiResponse<HeartbeatResponse>>) {
    reply(
        registry
            .heartbeat(req.node_id)
            .map(|incarnation| HeartbeatResponse { incarnation }),
    )
}

pub async fn handle_list_alive(
    Extension(registry): Extension<Arc<DiscoveryRegistry>>,
) -> (StatusCode, Json<ApiResponse<Vec<NodeRecord>>>) {
    reply(Ok(registry.list_alive()))
}

pub async fn handle_deregister(
    Extension(registry): Extension<Arc<DiscoveryRegistry>>,
    Json(req): Json<DeregisterRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    reply(registry.deregister(req.node_id))
}
