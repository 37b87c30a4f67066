//! # API Request/Response Types
//!
//! JSON structures for the HTTP API that are not core records. Core
//! records (`Simulation`, `StateNode`, `Run`, `NewState`, ...) are sent and
//! received as-is.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use simtree_core::{
    ConfigMap, ErrorKind, Payload, RunId, RunStatus, SimtreeError, StateId, StateNode, StoreStats,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

/// Store status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub simulations: usize,
    pub states: u64,
    pub runs: usize,
    pub active_runs: usize,
    pub branches: usize,
    pub persistent: bool,
}

impl StatusResponse {
    pub fn new(stats: StoreStats, persistent: bool) -> Self {
        Self {
            simulations: stats.simulations,
            states: stats.states,
            runs: stats.runs,
            active_runs: stats.active_runs,
            branches: stats.branches,
            persistent,
        }
    }
}

// =============================================================================
// RUN MUTATIONS
// =============================================================================

/// Append an existing state to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub state_id: StateId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub run_id: RunId,
    pub state_id: StateId,
    pub sequence_order: u64,
}

/// Result of creating a state directly inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub state: StateNode,
    pub sequence_order: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub status: RunStatus,
}

/// Mark a run completed. Without `total_reward` the accumulated reward is kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub total_reward: Option<Payload>,
}

// =============================================================================
// QUERIES
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunListQuery {
    pub status: Option<RunStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminalQuery {
    pub min_reward: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescendantsQuery {
    pub limit: Option<usize>,
}

/// Effective configuration of a run and the runs it was resolved through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub run_id: RunId,
    pub config: ConfigMap,
    /// Oldest ancestor first, ending with `run_id`.
    pub chain: Vec<RunId>,
}

// =============================================================================
// EXPORT RESPONSE
// =============================================================================

/// Binary snapshot export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    /// Base64-encoded snapshot bytes.
    pub data: String,
    pub size: usize,
    pub checksum: u64,
    /// BLAKE3 digest, hex-encoded.
    pub hash: String,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

/// HTTP status for an error kind.
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidReference => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict | ErrorKind::IllegalTransition => StatusCode::CONFLICT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Corruption => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

const fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not_found",
        ErrorKind::InvalidReference => "invalid_reference",
        ErrorKind::Conflict => "conflict",
        ErrorKind::IllegalTransition => "illegal_transition",
        ErrorKind::Corruption => "corruption",
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::StorageUnavailable => "storage_unavailable",
    }
}

impl From<SimtreeError> for ApiError {
    fn from(err: SimtreeError) -> Self {
        let kind = err.kind();
        Self {
            status: status_for(kind),
            kind: kind_name(kind),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, "{}", self.message);
        }
        let body = ErrorResponse {
            error: self.message,
            kind: self.kind.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}
