//! HTTP server implementation using Axum.

use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::models::{Challenge, LaunchedInstance, StatusSnapshot, UserStatus};
use crate::state::AppState;

#[derive(Deserialize)]
struct UserQuery {
    #[serde(default)]
    userid: String,
}

#[derive(Deserialize)]
struct LaunchQuery {
    #[serde(default)]
    userid: String,
    #[serde(default)]
    challid: String,
}

#[derive(Deserialize)]
struct ChallengeQuery {
    #[serde(default)]
    challid: String,
}

#[derive(Serialize)]
struct Success {
    #[serde(rename = "Success")]
    success: bool,
    #[serde(rename = "Challenge_Id", skip_serializing_if = "Option::is_none")]
    challenge_id: Option<String>,
}

impl Success {
    fn ok() -> Json<Self> {
        Json(Self {
            success: true,
            challenge_id: None,
        })
    }
}

/// Build the router. Challenge management and the status snapshot sit
/// behind the admin bearer token; everything else is open.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/addChallenge", get(add_challenge).post(add_challenge))
        .route("/removeChallenge", get(remove_challenge))
        .route("/getStatus", get(get_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/addInstance", get(add_instance))
        .route("/removeInstance", get(remove_instance))
        .route("/getUserStatus", get(get_user_status))
        .route("/extendTimeLeft", get(extend_time_left))
        .route("/health", get(health))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> RunnerResult<Response> {
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !state.is_admin(authorization) {
        warn!(path = %request.uri().path(), "rejected admin request");
        return Err(RunnerError::Unauthorized);
    }
    Ok(next.run(request).await)
}

async fn health() -> &'static str {
    "OK"
}

async fn add_instance(
    State(state): State<AppState>,
    Query(query): Query<LaunchQuery>,
) -> RunnerResult<Json<LaunchedInstance>> {
    let launched = state
        .engine
        .add_instance(&query.userid, &query.challid)
        .await?;
    Ok(Json(launched))
}

async fn remove_instance(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> RunnerResult<Json<Success>> {
    state.engine.remove_instance(&query.userid).await?;
    Ok(Success::ok())
}

async fn get_user_status(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> RunnerResult<Json<UserStatus>> {
    Ok(Json(state.engine.user_status(&query.userid)?))
}

async fn extend_time_left(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> RunnerResult<Json<Success>> {
    state.engine.extend_time_left(&query.userid).await?;
    Ok(Success::ok())
}

/// Accepts the challenge as a JSON body on either GET or POST, whatever the
/// content type says.
async fn add_challenge(
    State(state): State<AppState>,
    body: Bytes,
) -> RunnerResult<Json<Success>> {
    let challenge: Challenge = serde_json::from_slice(&body)
        .map_err(|e| RunnerError::invalid(format!("Invalid challenge: {e}")))?;
    let saved = state.engine.add_challenge(challenge).await?;
    Ok(Json(Success {
        success: true,
        challenge_id: Some(saved.challenge_id),
    }))
}

async fn remove_challenge(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> RunnerResult<Json<Success>> {
    state.engine.remove_challenge(&query.challid).await?;
    Ok(Success::ok())
}

async fn get_status(State(state): State<AppState>) -> RunnerResult<Json<StatusSnapshot>> {
    Ok(Json(state.engine.status().await?))
}
