//! # API Endpoint Handlers
//!
//! Every handler runs its store call on the blocking pool through
//! [`AppState::run`]; each call is one store transaction.

use super::{
    AppState,
    types::{
        ApiError, AppendRequest, AppendResponse, CompleteRequest, ConfigResponse,
        DescendantsQuery, ExportResponse, HealthResponse, RecordResponse, RunListQuery,
        StatusResponse, TerminalQuery, TransitionRequest,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use simtree_core::{
    BranchRequest, IntegrityReport, NewRun, NewSimulation, NewState, Run, RunComparison,
    RunFilter, RunId, RunNode, Simulation, SimulationId, StateId, StateNode,
};

/// Upper bound on states returned by `/states/{id}/descendants`.
pub const MAX_DESCENDANTS: usize = 10_000;

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Store counts.
pub async fn status_handler(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    state
        .run(|history| {
            let stats = history.stats()?;
            Ok(StatusResponse::new(
                stats,
                history.repository().is_persistent(),
            ))
        })
        .await
        .map(Json)
}

/// Structural integrity check.
pub async fn verify_handler(State(state): State<AppState>) -> ApiResult<IntegrityReport> {
    state.run(|history| history.verify()).await.map(Json)
}

// =============================================================================
// SIMULATIONS
// =============================================================================

pub async fn create_simulation_handler(
    State(state): State<AppState>,
    Json(request): Json<NewSimulation>,
) -> Result<(StatusCode, Json<Simulation>), ApiError> {
    let sim = state
        .mutate(move |history| history.create_simulation(request))
        .await?;
    Ok((StatusCode::CREATED, Json(sim)))
}

pub async fn list_simulations_handler(
    State(state): State<AppState>,
) -> ApiResult<Vec<Simulation>> {
    state
        .run(|history| history.list_simulations())
        .await
        .map(Json)
}

pub async fn get_simulation_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Simulation> {
    state
        .run(move |history| history.get_simulation(SimulationId(id)))
        .await
        .map(Json)
}

/// Runs of one simulation, optionally filtered by `?status=`.
pub async fn simulation_runs_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<RunListQuery>,
) -> ApiResult<Vec<Run>> {
    let filter = RunFilter {
        simulation_id: Some(SimulationId(id)),
        status: query.status,
    };
    state
        .run(move |history| history.list_runs(filter))
        .await
        .map(Json)
}

/// Branch hierarchy of one simulation.
pub async fn run_tree_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<RunNode>> {
    state
        .run(move |history| history.get_run_tree(SimulationId(id)))
        .await
        .map(Json)
}

// =============================================================================
// STATES
// =============================================================================

pub async fn create_state_handler(
    State(state): State<AppState>,
    Json(request): Json<NewState>,
) -> Result<(StatusCode, Json<StateNode>), ApiError> {
    let node = state
        .mutate(move |history| history.create_state(request))
        .await?;
    Ok((StatusCode::CREATED, Json(node)))
}

pub async fn get_state_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<StateNode> {
    state
        .run(move |history| history.get_state(StateId(id)))
        .await
        .map(Json)
}

/// Root-to-state path.
pub async fn lineage_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<StateNode>> {
    state
        .run(move |history| history.get_lineage(StateId(id)))
        .await
        .map(Json)
}

pub async fn children_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<StateNode>> {
    state
        .run(move |history| history.get_children(StateId(id)))
        .await
        .map(Json)
}

/// Breadth-first descendants, capped at `?limit=` or [`MAX_DESCENDANTS`].
pub async fn descendants_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<DescendantsQuery>,
) -> ApiResult<Vec<StateNode>> {
    let limit = query.limit.unwrap_or(MAX_DESCENDANTS).min(MAX_DESCENDANTS);
    state
        .run(move |history| history.descendants(StateId(id))?.take(limit).collect())
        .await
        .map(Json)
}

pub async fn terminal_states_handler(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> ApiResult<Vec<StateNode>> {
    state
        .run(move |history| history.terminal_states(query.min_reward))
        .await
        .map(Json)
}

/// Runs whose trajectory contains the state.
pub async fn state_runs_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<Run>> {
    state
        .run(move |history| history.runs_containing(StateId(id)))
        .await
        .map(Json)
}

// =============================================================================
// RUNS
// =============================================================================

pub async fn create_run_handler(
    State(state): State<AppState>,
    Json(request): Json<NewRun>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let run = state.mutate(move |history| history.create_run(request)).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn list_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<RunListQuery>,
) -> ApiResult<Vec<Run>> {
    let filter = RunFilter {
        simulation_id: None,
        status: query.status,
    };
    state
        .run(move |history| history.list_runs(filter))
        .await
        .map(Json)
}

pub async fn get_run_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Run> {
    state
        .run(move |history| history.get_run(RunId(id)))
        .await
        .map(Json)
}

/// Create a state and append it to the run in one transaction.
pub async fn record_state_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<NewState>,
) -> Result<(StatusCode, Json<RecordResponse>), ApiError> {
    let (node, sequence_order) = state
        .mutate(move |history| history.record_state(RunId(id), request))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RecordResponse {
            state: node,
            sequence_order,
        }),
    ))
}

/// Append an existing state to the run.
pub async fn append_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<AppendRequest>,
) -> ApiResult<AppendResponse> {
    let run_id = RunId(id);
    let sequence_order = state
        .mutate(move |history| history.append_state(run_id, request.state_id))
        .await?;
    Ok(Json(AppendResponse {
        run_id,
        state_id: request.state_id,
        sequence_order,
    }))
}

pub async fn trajectory_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<StateNode>> {
    state
        .run(move |history| history.get_trajectory(RunId(id)))
        .await
        .map(Json)
}

pub async fn transition_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Run> {
    state
        .mutate(move |history| history.transition_run(RunId(id), request.status))
        .await
        .map(Json)
}

pub async fn complete_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Run> {
    state
        .mutate(move |history| history.complete_run(RunId(id), request.total_reward))
        .await
        .map(Json)
}

/// Effective configuration after inheritance.
pub async fn config_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<ConfigResponse> {
    let run_id = RunId(id);
    state
        .run(move |history| {
            Ok(ConfigResponse {
                run_id,
                config: history.effective_config(run_id)?,
                chain: history
                    .inheritance_chain(run_id)?
                    .into_iter()
                    .map(|run| run.id)
                    .collect(),
            })
        })
        .await
        .map(Json)
}

pub async fn compare_handler(
    State(state): State<AppState>,
    Path((left, right)): Path<(u64, u64)>,
) -> ApiResult<RunComparison> {
    state
        .run(move |history| history.compare_runs(RunId(left), RunId(right)))
        .await
        .map(Json)
}

pub async fn branch_handler(
    State(state): State<AppState>,
    Json(request): Json<BranchRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let run = state.mutate(move |history| history.branch(request)).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

// =============================================================================
// EXPORT HANDLER
// =============================================================================

/// Export the whole store as a base64-encoded binary snapshot.
pub async fn export_handler(State(state): State<AppState>) -> ApiResult<ExportResponse> {
    state
        .run(|history| {
            let snapshot = history.snapshot()?;
            let bytes = snapshot.to_bytes()?;
            Ok(ExportResponse {
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                size: bytes.len(),
                checksum: snapshot.checksum(),
                hash: snapshot.crypto_hash()?,
            })
        })
        .await
        .map(Json)
}
