//! HTTP route definitions

use axum::{
    extract::{Extension, Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchStage, Rules};
use crate::http::middleware::{require_auth, AuthenticatedUser};
use crate::matchmaking::{EnqueueOutcome, MatchmakingError};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::{MatchType, PlayerInfo};

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/rules/:match_type", get(rules_handler))
        .route("/ws", get(ws_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/matchmaking/enqueue", post(enqueue_handler))
        .route("/matchmaking/dequeue", post(dequeue_handler))
        .route("/matches/:id", get(match_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_players: usize,
    classic_queue: usize,
    turbo_queue: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.match_registry.active_matches(),
        active_players: state.match_registry.total_players(),
        classic_queue: state.matchmaking.queue_size(MatchType::Classic).await,
        turbo_queue: state.matchmaking.queue_size(MatchType::Turbo).await,
    })
}

/// Field geometry and speeds, so clients can draw the table
async fn rules_handler(
    State(state): State<AppState>,
    Path(match_type): Path<MatchType>,
) -> Json<Rules> {
    Json(*state.rules.get(match_type))
}

// ============================================================================
// Matchmaking endpoints
// ============================================================================

#[derive(Deserialize)]
struct EnqueueRequest {
    #[serde(default)]
    match_type: MatchType,
}

#[derive(Serialize)]
struct EnqueueResponse {
    status: &'static str,
    match_type: MatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    match_id: Option<Uuid>,
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let outcome = state
        .matchmaking
        .enqueue(auth.user_id, req.match_type)
        .await?;

    let (status, match_id) = match outcome {
        EnqueueOutcome::Queued => ("queued", None),
        EnqueueOutcome::Matched(id) => ("matched", Some(id)),
    };

    Ok(Json(EnqueueResponse {
        status,
        match_type: req.match_type,
        match_id,
    }))
}

async fn dequeue_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Result<StatusCode, AppError> {
    state.matchmaking.dequeue(auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Match endpoints
// ============================================================================

#[derive(Serialize)]
struct MatchResponse {
    match_id: Uuid,
    match_type: MatchType,
    stage: MatchStage,
    left: PlayerInfo,
    right: PlayerInfo,
}

async fn match_handler(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchResponse>, AppError> {
    let handle = state
        .match_registry
        .get(&match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {match_id}")))?;

    Ok(Json(MatchResponse {
        match_id: handle.id,
        match_type: handle.match_type,
        stage: handle.stage(),
        left: handle.left.clone(),
        right: handle.right.clone(),
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self {
            AppError::Matchmaking(e) => {
                let status = match e {
                    MatchmakingError::AlreadyQueued | MatchmakingError::AlreadyInMatch => {
                        StatusCode::CONFLICT
                    }
                    MatchmakingError::NotQueued | MatchmakingError::StaleMatch => {
                        StatusCode::NOT_FOUND
                    }
                    MatchmakingError::NotAParticipant => StatusCode::FORBIDDEN,
                    MatchmakingError::Timeout => StatusCode::REQUEST_TIMEOUT,
                    MatchmakingError::IdentityLookupFailed(_)
                    | MatchmakingError::MatchCreationFailed(_) => StatusCode::BAD_GATEWAY,
                };
                (status, e.code())
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };

        let body = serde_json::json!({
            "code": code,
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
