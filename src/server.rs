use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::models::EntryCreatedEvent;
use crate::runtime::SchedulerRuntime;
use crate::scheduler::{CycleKind, CycleRunner, CycleStatus};

#[derive(Clone)]
pub struct ServerState {
    pub cycles: Arc<CycleRunner>,
    pub auth: BackendAuthConfig,
    pub config: Arc<tokio::sync::RwLock<SchedulerConfig>>,
    pub entry_tx: flume::Sender<EntryCreatedEvent>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct CycleStatusEntry {
    cycle: &'static str,
    #[serde(flatten)]
    status: CycleStatus,
}

#[derive(Debug, Serialize)]
struct SchedulerStatusResponse {
    paused: bool,
    cycles: Vec<CycleStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct SetPauseRequest {
    paused: bool,
}

#[derive(Debug, Serialize)]
struct PauseStateResponse {
    paused: bool,
}

#[derive(Debug, Serialize)]
struct RunCycleResponse {
    cycle: String,
    ran_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct EntryAcceptedResponse {
    status: &'static str,
}

pub async fn serve_backend(runtime: SchedulerRuntime) -> Result<()> {
    let bind_addr = std::env::var("PENPAL_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8790".to_string())
        .parse::<SocketAddr>()
        .context("Invalid PENPAL_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;

    let state = Arc::new(ServerState {
        cycles: runtime.cycles.clone(),
        auth,
        config: Arc::new(tokio::sync::RwLock::new(runtime.config.clone())),
        entry_tx: runtime.entry_tx.clone(),
    });

    runtime.spawn_background_tasks();

    let protected = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config).put(update_config))
        .route("/scheduler/status", get(get_scheduler_status))
        .route("/scheduler/pause", put(set_pause))
        .route("/scheduler/cycles/:kind/run", post(run_cycle))
        .route("/webhook/entry-created", post(entry_created))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Penpal scheduler listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("PENPAL_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("PENPAL_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "PENPAL_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid PENPAL_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_config(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SchedulerConfig>, (StatusCode, String)> {
    let config = state.config.read().await.clone();
    Ok(Json(config))
}

/// Persists the new config and updates the served copy. Cycle cadence and
/// policy thresholds are read per tick, so most changes apply on the next
/// cycle; the database path applies on restart.
async fn update_config(
    State(state): State<Arc<ServerState>>,
    Json(new_config): Json<SchedulerConfig>,
) -> Result<Json<SchedulerConfig>, (StatusCode, String)> {
    if let Err(error) = new_config.save() {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save config: {error}"),
        ));
    }
    {
        let mut guard = state.config.write().await;
        *guard = new_config.clone();
    }
    tracing::info!("Scheduler config updated via API");
    Ok(Json(new_config))
}

async fn get_scheduler_status(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SchedulerStatusResponse>, (StatusCode, String)> {
    let cycles = state
        .cycles
        .statuses()
        .await
        .into_iter()
        .map(|(kind, status)| CycleStatusEntry {
            cycle: kind.as_str(),
            status,
        })
        .collect();
    Ok(Json(SchedulerStatusResponse {
        paused: state.cycles.is_paused(),
        cycles,
    }))
}

async fn set_pause(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SetPauseRequest>,
) -> Result<Json<PauseStateResponse>, (StatusCode, String)> {
    state.cycles.set_paused(body.paused);
    Ok(Json(PauseStateResponse {
        paused: state.cycles.is_paused(),
    }))
}

/// Manual trigger for one cycle, pause state notwithstanding.
async fn run_cycle(
    State(state): State<Arc<ServerState>>,
    Path(kind): Path<String>,
) -> Result<Json<RunCycleResponse>, (StatusCode, String)> {
    let Some(cycle) = CycleKind::parse(&kind) else {
        return Err((
            StatusCode::NOT_FOUND,
            format!("unknown cycle '{}'", kind),
        ));
    };
    state
        .cycles
        .run_cycle(cycle)
        .await
        .map_err(internal_error)?;
    Ok(Json(RunCycleResponse {
        cycle: cycle.as_str().to_string(),
        ran_at: Utc::now(),
    }))
}

async fn entry_created(
    State(state): State<Arc<ServerState>>,
    Json(event): Json<EntryCreatedEvent>,
) -> Result<(StatusCode, Json<EntryAcceptedResponse>), (StatusCode, String)> {
    if event.entry_id.trim().is_empty() || event.user_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "entry_id and user_id are required".to_string(),
        ));
    }
    state
        .entry_tx
        .send(event)
        .map_err(|_| internal_error(anyhow!("Webhook gateway is not running")))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EntryAcceptedResponse { status: "accepted" }),
    ))
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
