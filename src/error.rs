//! Cluster Error Taxonomy
//!
//! A single error type crosses every role boundary. It is serializable so a
//! Node's `NotOwner` reply or a Discovery `AlreadyRegistered` conflict reaches
//! the caller unchanged, whether the call went over HTTP or in-process.
//!
//! ## Propagation
//! - **Recoverable** (`NotOwner`, `Timeout`, `Transport`): retried locally by
//!   the Client or Master within a bounded budget.
//! - **Operator-visible** (`AlreadyRegistered`, `DataLossRisk`): never retried,
//!   always reported.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shard::types::{MapVersion, NodeId, ShardId, TaskId};

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClusterError {
    /// The responder does not consider itself the `Stable` owner of the shard.
    /// `current_version` is the newest map version the responder knows about.
    #[error("not owner of shard {shard}, current map version is {current_version}")]
    NotOwner {
        shard: ShardId,
        current_version: MapVersion,
    },

    #[error("{node_id} is already registered at {address}")]
    AlreadyRegistered { node_id: NodeId, address: String },

    #[error("{0} is not registered")]
    UnknownNode(NodeId),

    #[error("{0} has been declared dead")]
    NodeDead(NodeId),

    #[error("migration {task_id} aborted: {reason}")]
    MigrationAborted { task_id: TaskId, reason: String },

    /// The source of a shard died before handing it off; the new owner starts empty.
    #[error("shard {shard} lost its only copy when {node_id} died")]
    DataLossRisk { shard: ShardId, node_id: NodeId },

    #[error("timed out during {operation}")]
    Timeout { operation: String },

    #[error("unknown migration task {0}")]
    UnknownTask(TaskId),

    #[error("shard {shard} is {state}, cannot {operation}")]
    InvalidShardState {
        shard: ShardId,
        state: String,
        operation: String,
    },

    #[error("no shard map has been committed yet")]
    NoShardMap,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ClusterError>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ClusterError {
    /// Staleness and transient unavailability. Everything else is either a
    /// conflict an operator must see or a definitive answer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::NotOwner { .. }
                | ClusterError::Timeout { .. }
                | ClusterError::Transport(_)
        )
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ClusterError::NotOwner { .. } | ClusterError::AlreadyRegistered { .. } => {
                StatusCode::CONFLICT
            }
            ClusterError::UnknownNode(_) | ClusterError::UnknownTask(_) => StatusCode::NOT_FOUND,
            ClusterError::NodeDead(_) => StatusCode::GONE,
            ClusterError::InvalidShardState { .. } => StatusCode::PRECONDITION_FAILED,
            ClusterError::NoShardMap => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::Transport(_) | ClusterError::RetriesExhausted { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ClusterError::MigrationAborted { .. }
            | ClusterError::DataLossRisk { .. }
            | ClusterError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        ClusterError::Timeout {
            operation: operation.into(),
        }
    }
}

/// Body of every HTTP reply: `{"ok": <payload>}` or `{"error": <ClusterError>}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiResponse<T> {
    Ok(T),
    Error(ClusterError),
}

impl<T> ApiResponse<T> {
    pub fn ok(value: T) -> Self {
        ApiResponse::Ok(value)
    }

    pub fn err(error: ClusterError) -> Self {
        ApiResponse::Error(error)
    }

    pub fn into_result(self) -> ClusterResult<T> {
        match self {
            ApiResponse::Ok(value) => Ok(value),
            ApiResponse::Error(error) => Err(error),
        }
    }
}

impl<T> From<ClusterResult<T>> for ApiResponse<T> {
    fn from(result: ClusterResult<T>) -> Self {
        match result {
            Ok(value) => ApiResponse::Ok(value),
            Err(error) => ApiResponse::Error(error),
        }
    }
}
