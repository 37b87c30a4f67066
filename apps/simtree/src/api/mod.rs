//! # Simtree HTTP API Module
//!
//! REST API over the history store, built on axum.
//!
//! ## Endpoints
//!
//! - `GET /health`, `GET /status`, `GET /verify`, `POST /export`
//! - `POST|GET /simulations`, `GET /simulations/{id}`,
//!   `GET /simulations/{id}/runs`, `GET /simulations/{id}/tree`
//! - `POST /states`, `GET /states/terminal`, `GET /states/{id}`,
//!   `GET /states/{id}/lineage|children|descendants|runs`
//! - `POST|GET /runs`, `POST /runs/branch`, `GET /runs/{id}`,
//!   `POST /runs/{id}/states|append|transition|complete`,
//!   `GET /runs/{id}/trajectory|config`, `GET /runs/{a}/compare/{b}`
//!
//! ## Security Configuration
//!
//! - `server.cors_origins` / `SIMTREE_CORS_ORIGINS`: comma-separated origins, or "*" (default: localhost only)
//! - `server.rate_limit` / `SIMTREE_RATE_LIMIT`: requests per second (default: 100, 0 to disable)
//! - `SIMTREE_API_KEY`: if set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::keys_match;
pub use handlers::MAX_DESCENDANTS;
pub use middleware::create_rate_limiter;
pub use types::{
    ApiError, AppendRequest, AppendResponse, CompleteRequest, ConfigResponse, ErrorResponse,
    ExportResponse, HealthResponse, RecordResponse, StatusResponse, TransitionRequest, status_for,
};

use crate::error::AppError;
use crate::settings::ServerSettings;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use simtree_core::{History, SimtreeError};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
///
/// The store is transactional on its own, so no lock wraps it.
#[derive(Clone)]
pub struct AppState {
    pub history: Arc<History>,
    snapshot_file: Option<Arc<SnapshotFile>>,
}

/// Snapshot file rewritten after every mutating request.
#[derive(Debug)]
struct SnapshotFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SnapshotFile {
    /// Capture and replace the file; concurrent writers take turns, so
    /// the last one to finish holds the newest history.
    fn write(&self, history: &History) -> Result<(), SimtreeError> {
        let _turn = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = history.snapshot()?.to_bytes()?;
        let staging = self.path.with_extension("partial");
        std::fs::write(&staging, &bytes)
            .and_then(|()| std::fs::rename(&staging, &self.path))
            .map_err(|e| {
                SimtreeError::StorageUnavailable(format!(
                    "cannot write {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot file written");
        Ok(())
    }
}

impl AppState {
    #[must_use]
    pub fn new(history: History) -> Self {
        Self::shared(Arc::new(history))
    }

    #[must_use]
    pub const fn shared(history: Arc<History>) -> Self {
        Self {
            history,
            snapshot_file: None,
        }
    }

    /// Persist the whole history to `path` after each mutation.
    #[must_use]
    pub fn with_snapshot_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_file = Some(Arc::new(SnapshotFile {
            path: path.into(),
            lock: Mutex::new(()),
        }));
        self
    }

    /// Run a store call on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&History) -> Result<T, SimtreeError> + Send + 'static,
        T: Send + 'static,
    {
        let history = Arc::clone(&self.history);
        tokio::task::spawn_blocking(move || f(&history))
            .await
            .map_err(|e| ApiError::internal(format!("Store task failed: {}", e)))?
            .map_err(ApiError::from)
    }

    /// Like [`AppState::run`], then rewrite the snapshot file if one is set.
    pub async fn mutate<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&History) -> Result<T, SimtreeError> + Send + 'static,
        T: Send + 'static,
    {
        let file = self.snapshot_file.clone();
        self.run(move |history| {
            let value = f(history)?;
            if let Some(file) = file {
                file.write(history)?;
            }
            Ok(value)
        })
        .await
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer from `server.cors_origins`.
fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins.map(str::trim) {
        Some("*") => {
            tracing::warn!("CORS: Allowing ALL origins. This is insecure for production!");
            CorsLayer::permissive()
        }
        Some(list) => {
            let allowed: Vec<HeaderValue> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<HeaderValue>() {
                    Ok(hv) => {
                        tracing::info!("CORS: Allowing origin: {}", s);
                        Some(hv)
                    }
                    Err(e) => {
                        tracing::warn!("CORS: Invalid origin '{}': {}", s, e);
                        None
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: No valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                restricted_cors(allowed)
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    restricted_cors(origins)
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS, body limit, rate
/// limiting (if enabled), authentication (if configured).
pub fn create_router(state: AppState, settings: &ServerSettings) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/verify", get(handlers::verify_handler))
        .route("/export", post(handlers::export_handler))
        .route(
            "/simulations",
            post(handlers::create_simulation_handler).get(handlers::list_simulations_handler),
        )
        .route("/simulations/{id}", get(handlers::get_simulation_handler))
        .route(
            "/simulations/{id}/runs",
            get(handlers::simulation_runs_handler),
        )
        .route("/simulations/{id}/tree", get(handlers::run_tree_handler))
        .route("/states", post(handlers::create_state_handler))
        .route("/states/terminal", get(handlers::terminal_states_handler))
        .route("/states/{id}", get(handlers::get_state_handler))
        .route("/states/{id}/lineage", get(handlers::lineage_handler))
        .route("/states/{id}/children", get(handlers::children_handler))
        .route("/states/{id}/descendants", get(handlers::descendants_handler))
        .route("/states/{id}/runs", get(handlers::state_runs_handler))
        .route(
            "/runs",
            post(handlers::create_run_handler).get(handlers::list_runs_handler),
        )
        .route("/runs/branch", post(handlers::branch_handler))
        .route("/runs/{id}", get(handlers::get_run_handler))
        .route("/runs/{id}/states", post(handlers::record_state_handler))
        .route("/runs/{id}/append", post(handlers::append_handler))
        .route("/runs/{id}/trajectory", get(handlers::trajectory_handler))
        .route("/runs/{id}/transition", post(handlers::transition_handler))
        .route("/runs/{id}/complete", post(handlers::complete_handler))
        .route("/runs/{id}/config", get(handlers::config_handler))
        .route("/runs/{id}/compare/{other}", get(handlers::compare_handler));

    match settings.api_key.as_deref() {
        Some(key) => {
            tracing::info!("API key authentication enabled");
            router = router.layer(axum_middleware::from_fn_with_state(
                auth::ApiKey::from(key),
                auth::api_key_auth_middleware,
            ));
        }
        None => tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible! \
             Set SIMTREE_API_KEY to enable authentication."
        ),
    }

    match create_rate_limiter(settings.rate_limit) {
        Some(limiter) => {
            tracing::info!("Rate limiting enabled: {} requests/second", settings.rate_limit);
            router = router.layer(axum_middleware::from_fn_with_state(
                limiter,
                middleware::rate_limit_middleware,
            ));
        }
        None => tracing::info!("Rate limiting disabled"),
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer(settings.cors_origins.as_deref()))
                .layer(axum::extract::DefaultBodyLimit::max(settings.body_limit)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `state` on `addr` until `shutdown` resolves.
pub async fn run_server<S>(
    addr: &str,
    state: AppState,
    settings: &ServerSettings,
    shutdown: S,
) -> Result<(), AppError>
where
    S: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, settings);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(AppError::io(format!("Bind {}", addr)))?;

    tracing::info!("Simtree HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(AppError::io("Server error"))
}
