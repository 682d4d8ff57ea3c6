//! HTTP surface: look up players, start jobs, poll them, stream their
//! progress.

mod error;

pub use error::ApiError;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::models::JobId;
use crate::error::PipelineError;
use crate::orchestrator::{
    HealthReport, JobRequest, JobSnapshot, Orchestrator, PlayerLookup, ProfileLookup,
};
use crate::progress::ProgressEvent;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Interval between SSE keep-alive comments.
    pub keepalive: Duration,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/player/:game_name/:tag_line", get(lookup_player))
        .route("/api/profile/:game_name/:tag_line", get(player_profile))
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/:job_id", get(get_job))
        .route("/api/jobs/:job_id/progress", get(job_progress))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// Serve until Ctrl-C.
pub async fn serve(bind: &str, state: AppState, cors_origins: &[String]) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state, cors_origins))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid job id").with_detail(raw.to_string()))
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.orchestrator.health().await)
}

async fn create_job(
    State(state): State<AppState>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) =
        body.map_err(|e| ApiError::bad_request("Invalid request body").with_detail(e.body_text()))?;

    let ticket = state.orchestrator.submit(request).await?;
    info!(job_id = %ticket.job_id, "Job accepted");
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn lookup_player(
    State(state): State<AppState>,
    Path((game_name, tag_line)): Path<(String, String)>,
) -> Result<Json<PlayerLookup>, ApiError> {
    let player = state
        .orchestrator
        .resolve_riot_id(&game_name, &tag_line)
        .await?;
    Ok(Json(player))
}

async fn player_profile(
    State(state): State<AppState>,
    Path((game_name, tag_line)): Path<(String, String)>,
) -> Result<Json<ProfileLookup>, ApiError> {
    let player = state
        .orchestrator
        .resolve_riot_id(&game_name, &tag_line)
        .await?;
    let profile = state
        .orchestrator
        .profile(&player.puuid, &player.riot_id)
        .await
        .map_err(|e| PipelineError::from_lookup(e, &player.riot_id))?;
    Ok(Json(profile))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state
        .orchestrator
        .snapshot(job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

async fn job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let subscription = state
        .orchestrator
        .subscribe(job_id)
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    let events = subscription
        .into_stream()
        .map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.keepalive)
            .text("keepalive"),
    ))
}

fn sse_event(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.step.as_str()).data(data)
}
