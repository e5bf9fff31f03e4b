use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use latprobe_common::{CreateRunResponse, ErrorResponse, RunParameters};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use uuid::Uuid;

pub mod admission;
pub mod analytics;
pub mod config;
pub mod probe;
pub mod runner;
pub mod store;
pub mod validation;

use admission::{Admission, AdmissionGate, WindowCounters};
use config::{AdmissionConfig, ProbeConfig, DEFAULT_RECENT_RUNS, MAX_RECENT_RUNS};
use probe::ProbeExecutor;
use runner::{RunController, RunError};
use store::{MemoryStore, RunStore, SqliteStore, StoreError};
use validation::validate_parameters;

/// Abstraction over current time for testability.
pub trait Clock: Send + Sync {
    fn unix_now_secs(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub controller: RunController,
    pub gate: Arc<AdmissionGate>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: ProbeExecutor,
        admission: AdmissionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let counters = Arc::new(WindowCounters::new());
        Self {
            controller: RunController::new(store.clone(), executor),
            gate: Arc::new(AdmissionGate::new(admission, clock, counters)),
            store,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub probe: ProbeConfig,
    pub admission: AdmissionConfig,
    /// SQLite database file; `None` keeps runs in memory.
    pub database: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            probe: ProbeConfig::default(),
            admission: AdmissionConfig::default(),
            database: None,
        }
    }
}

/// Latprobe API server
pub struct Server {
    config: ServerConfig,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Get the server's configured address
    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Create the application router with the given state
    pub fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/runs", post(handle_create_run).get(handle_list_runs))
            .route("/runs/:id", get(handle_get_run))
            .route("/runs/:id/samples", get(handle_list_samples))
            .route("/runs/:id/analytics", get(handle_get_analytics))
            .route("/r/:slug", get(handle_get_run_by_slug))
            .with_state(state)
    }

    /// Run the server, signalling `ready_tx` with the bound address once accepting connections
    pub async fn run(
        self,
        ready_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.config.admission.validate()?;
        let store: Arc<dyn RunStore> = match &self.config.database {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let executor = ProbeExecutor::new(&self.config.probe)?;
        let state = AppState::new(store, executor, self.config.admission.clone(), Arc::new(SystemClock));

        spawn_admission_sweeper(state.gate.clone());

        let app = Self::create_router(state);
        let listener = tokio::net::TcpListener::bind(self.config.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "latprobe server listening");
        ready_tx.send(local_addr).ok();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }
}

/// Periodically forget callers whose admission window has elapsed.
fn spawn_admission_sweeper(gate: Arc<AdmissionGate>) {
    let period = std::time::Duration::from_secs(gate.config().window_secs());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;
            gate.sweep();
        }
    });
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointQuery {
    pub endpoint: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into(), retry_after_secs: None })).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    error!(error = %err, "run store error");
    if err.is_fatal() {
        error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    } else {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    let body = ErrorResponse {
        error: format!("Rate limit exceeded, try again in {retry_after_secs} seconds"),
        retry_after_secs: Some(retry_after_secs),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

fn parse_run_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id)
        .map_err(|_| error_response(StatusCode::NOT_FOUND, format!("Run not found: {id}")))
}

/// Admission key: the peer IP. With `trust_forwarded_for`, the first
/// `X-Forwarded-For` hop wins when present.
pub fn caller_key(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if !trust_forwarded_for {
        return peer.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Handler for GET /health
pub async fn handle_health() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

/// Handler for POST /runs: validates, applies the admission gate, then starts the run.
/// Invalid input is rejected before it counts against the caller's window.
pub async fn handle_create_run(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parameters: RunParameters = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid run parameters: {err}")),
    };
    if let Err(err) = validate_parameters(&parameters) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    let caller = caller_key(&headers, peer, state.gate.config().trust_forwarded_for);
    if let Admission::Rejected { retry_after_secs } = state.gate.check(&caller) {
        return rate_limited_response(retry_after_secs);
    }

    match state.controller.start_run(parameters) {
        Ok(run) => {
            let body = CreateRunResponse { id: run.id, slug: run.slug, status: run.status };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(RunError::Validation(err)) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        Err(RunError::Store(err)) => store_error_response(err),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Handler for GET /runs: most recent runs first.
pub async fn handle_list_runs(State(state): State<AppState>, Query(query): Query<ListRunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_RUNS).clamp(1, MAX_RECENT_RUNS);
    match state.store.list_recent_runs(limit) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error_response(err),
    }
}

/// Handler for GET /runs/:id
pub async fn handle_get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let run_id = match parse_run_id(&id) {
        Ok(run_id) => run_id,
        Err(r) => return r,
    };
    match state.store.get_run_by_id(run_id) {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Run not found: {id}")),
        Err(err) => store_error_response(err),
    }
}

/// Handler for GET /r/:slug: resolves the shareable slug.
pub async fn handle_get_run_by_slug(State(state): State<AppState>, Path(slug): Path<String>) -> Response {
    match state.store.get_run_by_slug(&slug) {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Run not found: {slug}")),
        Err(err) => store_error_response(err),
    }
}

/// Handler for GET /runs/:id/samples: samples so far, in creation order.
pub async fn handle_list_samples(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> Response {
    let run_id = match parse_run_id(&id) {
        Ok(run_id) => run_id,
        Err(r) => return r,
    };
    match state.store.get_run_by_id(run_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("Run not found: {id}")),
        Err(err) => return store_error_response(err),
    }
    match state.store.list_samples(run_id, query.endpoint.as_deref()) {
        Ok(samples) => Json(samples).into_response(),
        Err(err) => store_error_response(err),
    }
}

/// Handler for GET /runs/:id/analytics: computed on demand from the samples
/// recorded so far, so it also works while the run is still going.
pub async fn handle_get_analytics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> Response {
    let run_id = match parse_run_id(&id) {
        Ok(run_id) => run_id,
        Err(r) => return r,
    };
    let run = match state.store.get_run_by_id(run_id) {
        Ok(Some(run)) => run,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("Run not found: {id}")),
        Err(err) => return store_error_response(err),
    };
    match state.store.list_samples(run_id, query.endpoint.as_deref()) {
        Ok(samples) => Json(analytics::compute_run_analytics(&run, &samples)).into_response(),
        Err(err) => store_error_response(err),
    }
}
