//! # REST API
//!
//! Builds the axum router for the gateway's HTTP interface. All endpoints
//! share application state through axum's `State` extractor.
//!
//! The decryption boundary lives here: an external responder polls
//! `/decryptions/pending`, opens the handles with the network key, and posts
//! attested answers to `/decryptions/resolve`.
//!
//! ## Endpoints
//!
//! | Method | Path                     | Description                          |
//! |--------|--------------------------|--------------------------------------|
//! | GET    | `/health`                | Liveness probe                       |
//! | GET    | `/status`                | Node status and runtime counters     |
//! | GET    | `/ledgers`               | Deployed confidential ledgers        |
//! | GET    | `/ledgers/:address`      | One ledger's metadata                |
//! | GET    | `/vaults`                | Deployed lending vaults              |
//! | GET    | `/decryptions/pending`   | Requests awaiting the responder      |
//! | POST   | `/decryptions/resolve`   | Submit an attested resolution        |
//! | GET    | `/events`                | Event log page (`after`, `limit`)    |

use axum::{
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cloak_contracts::correlator::ResolutionFault;
use cloak_contracts::runtime::RuntimeStats;
use cloak_contracts::{Runtime, RuntimeError};
use cloak_protocol::config::MAX_EVENTS_PER_PAGE;
use cloak_protocol::{Address, Resolution};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone; everything heavy sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// Network identifier (e.g., "devnet").
    pub network: String,
    pub runtime: Arc<Runtime>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ledgers", get(ledgers_handler))
        .route("/ledgers/:address", get(ledger_handler))
        .route("/vaults", get(vaults_handler))
        .route("/decryptions/pending", get(pending_handler))
        .route("/decryptions/resolve", post(resolve_handler))
        .route("/events", get(events_handler))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.metrics.http_requests_total.inc();
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    /// The responder key every contract verifies attestations against.
    pub responder_key: String,
    pub stats: RuntimeStats,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// Query string for `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Return records with a sequence number above this.
    #[serde(default)]
    pub after: u64,
    pub limit: Option<usize>,
}

/// Error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Present when a resolution was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<ResolutionFault>,
}

/// A failed request: status code plus [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: impl ToString) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                fault: None,
            },
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        if let Some(fault) = err.resolution_fault() {
            return Self {
                status: StatusCode::CONFLICT,
                body: ErrorResponse {
                    error: err.to_string(),
                    fault: Some(fault),
                },
            };
        }
        let status = match err {
            RuntimeError::UnknownLedger(_) | RuntimeError::UnknownVault(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        responder_key: state.runtime.config().responder_key.to_hex(),
        stats: state.runtime.stats(),
        timestamp: state.runtime.now().to_rfc3339(),
    })
}

async fn ledgers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.ledgers())
}

async fn ledger_handler(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let address: Address = address
        .parse()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    Ok(Json(state.runtime.ledger_info(address)?))
}

async fn vaults_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.vaults())
}

/// `GET /decryptions/pending`: what the responder should answer next,
/// oldest first. Overdue requests are already filtered out.
async fn pending_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.pending_decryptions())
}

/// `POST /decryptions/resolve`: verify an attested resolution and resume
/// whatever was waiting on it.
///
/// 409 with a `fault` when the resolution itself is refused (unknown id,
/// replay, expiry, bad attestation, commitment mismatch); 422 when it
/// verified but the suspended operation could not complete.
async fn resolve_handler(
    State(state): State<AppState>,
    Json(resolution): Json<Resolution>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let result = state.runtime.resolve(resolution);
    state
        .metrics
        .resolution_latency_seconds
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(report) => {
            state.metrics.resolutions_accepted_total.inc();
            state.metrics.observe(&state.runtime.stats());
            Ok(Json(report))
        }
        Err(e) => {
            state.metrics.resolutions_rejected_total.inc();
            Err(e.into())
        }
    }
}

/// `GET /events?after=N&limit=M`: one page of the event log. `limit` is
/// capped at [`MAX_EVENTS_PER_PAGE`].
async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(MAX_EVENTS_PER_PAGE)
        .min(MAX_EVENTS_PER_PAGE);
    Json(state.runtime.events(query.after, limit))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
