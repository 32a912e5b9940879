//! Uploader-facing HTTP API.
//!
//! The uploader polls the pending queue, pushes rows to the remote backend
//! and acknowledges what the server accepted. Nothing here talks to the
//! network on its own.

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use kcal_core::models::{EntityKind, PendingCount, SyncAck, SyncRecord, SyncTombstone, UserId};
use kcal_core::{Store, StoreError};

const BODY_LIMIT: usize = 5 * 1024 * 1024; // 5 MB

#[derive(Clone)]
struct AppState {
    store: Store,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct UserQuery {
    user: String,
}

impl UserQuery {
    fn owner(&self) -> Result<UserId, ApiError> {
        UserId::new(self.user.as_str()).map_err(|e| ApiError::BadRequest(e.to_string()))
    }
}

#[derive(Deserialize)]
struct AckRequest {
    acks: Vec<SyncAck>,
}

#[derive(Deserialize)]
struct TombstoneAckRequest {
    seqs: Vec<i64>,
}

#[derive(Serialize)]
struct AckResponse {
    requested: usize,
    acknowledged: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Unavailable,
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage busy, retry later".to_string(),
            ),
            Self::Internal(err) => {
                tracing::error!(event = "api_internal_error", error = %format!("{err:#}"));
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } | StoreError::OnboardingNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            StoreError::Unauthorized { .. } => Self::Forbidden(err.to_string()),
            StoreError::Validation(msg) => Self::BadRequest(msg),
            e if e.is_transient() => Self::Unavailable,
            e => Self::Internal(e.into()),
        }
    }
}

fn parse_kind(kind: &str) -> Result<EntityKind, ApiError> {
    kind.parse().map_err(|e: StoreError| ApiError::BadRequest(e.to_string()))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn pending_counts(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<PendingCount>>, ApiError> {
    let owner = query.owner()?;
    Ok(Json(state.store.pending_counts(&owner).await?))
}

async fn list_unsynced(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SyncRecord>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let owner = query.owner()?;
    Ok(Json(state.store.list_unsynced(kind, &owner).await?))
}

async fn ack_synced(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(req): Json<AckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let kind = parse_kind(&kind)?;
    if req.acks.iter().any(|a| a.local_id.trim().is_empty()) {
        return Err(ApiError::BadRequest("local_id must not be empty".to_string()));
    }
    let requested = req.acks.len();
    let acknowledged = state.store.mark_synced(kind, req.acks).await?;
    tracing::info!(event = "sync_acked", %kind, requested, acknowledged);
    Ok(Json(AckResponse {
        requested,
        acknowledged,
    }))
}

async fn list_tombstones(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SyncTombstone>>, ApiError> {
    let owner = query.owner()?;
    Ok(Json(state.store.list_tombstones(&owner).await?))
}

async fn ack_tombstones(
    State(state): State<AppState>,
    Json(req): Json<TombstoneAckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let requested = req.seqs.len();
    let acknowledged = state.store.ack_tombstones(req.seqs).await?;
    Ok(Json(AckResponse {
        requested,
        acknowledged,
    }))
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync/pending", get(pending_counts))
        .route("/api/sync/{kind}", get(list_unsynced))
        .route("/api/sync/{kind}/ack", post(ack_synced))
        .route("/api/tombstones", get(list_tombstones))
        .route("/api/tombstones/ack", post(ack_tombstones))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        // Added after the auth layer: reachable without a key.
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    store: Store,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState {
        store,
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {}...{} (see api_key file in data directory)",
            &key[..4],
            &key[key.len() - 4..],
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    tracing::info!(event = "server_started", %bind, port, auth = api_key.is_some());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    tracing::info!(event = "server_stopped");

    Ok(())
}
