//! Unit tests for API types serialization/deserialization.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::StatusCode;
use simtree::api::{
    ApiError, AppendRequest, CompleteRequest, HealthResponse, StatusResponse, TransitionRequest,
    status_for,
};
use simtree_core::{ErrorKind, RunId, RunStatus, SimtreeError, StateId, StoreStats};

// =============================================================================
// HEALTH RESPONSE TESTS
// =============================================================================

#[test]
fn test_health_response_default() {
    let health = HealthResponse::default();
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
}

#[test]
fn test_health_response_deserialization() {
    let json = r#"{"status":"healthy","version":"1.0.0"}"#;
    let health: HealthResponse = serde_json::from_str(json).unwrap();

    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, "1.0.0");
}

// =============================================================================
// STATUS RESPONSE TESTS
// =============================================================================

#[test]
fn test_status_response_from_stats() {
    let stats = StoreStats {
        simulations: 2,
        states: 120,
        runs: 5,
        active_runs: 3,
        branches: 4,
    };
    let status = StatusResponse::new(stats, true);

    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("\"states\":120"));
    assert!(json.contains("\"branches\":4"));
    assert!(json.contains("\"persistent\":true"));
}

// =============================================================================
// REQUEST TESTS
// =============================================================================

#[test]
fn test_append_request_takes_plain_id() {
    let request: AppendRequest = serde_json::from_str(r#"{"state_id":7}"#).unwrap();
    assert_eq!(request.state_id, StateId(7));
}

#[test]
fn test_transition_request_lowercase_status() {
    let request: TransitionRequest = serde_json::from_str(r#"{"status":"paused"}"#).unwrap();
    assert_eq!(request.status, RunStatus::Paused);

    let result: Result<TransitionRequest, _> = serde_json::from_str(r#"{"status":"running"}"#);
    assert!(result.is_err());
}

#[test]
fn test_complete_request_reward_optional() {
    let empty: CompleteRequest = serde_json::from_str("{}").unwrap();
    assert!(empty.total_reward.is_none());

    let vector: CompleteRequest =
        serde_json::from_str(r#"{"total_reward":[1.0,-0.5]}"#).unwrap();
    let reward = vector.total_reward.unwrap();
    assert!(reward.as_value().is_array());
}

// =============================================================================
// ERROR MAPPING TESTS
// =============================================================================

#[test]
fn test_status_codes_by_kind() {
    assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
    assert_eq!(
        status_for(ErrorKind::InvalidReference),
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorKind::IllegalTransition), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_for(ErrorKind::StorageUnavailable),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        status_for(ErrorKind::Corruption),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_api_error_from_store_error() {
    let err = ApiError::from(SimtreeError::DuplicateState {
        run: RunId(1),
        state: StateId(2),
    });
    assert_eq!(err.status, StatusCode::CONFLICT);
    assert_eq!(err.kind, "conflict");
    assert!(err.message.contains("already belongs"));
}
