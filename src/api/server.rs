//! HTTP server setup: router and API handlers.

use super::state::ApiState;
use crate::ContextKey;
use crate::coordinator::CoordinatorSnapshot;
use crate::llm::chain::ProviderStatusEntry;
use crate::llm::diagnostics::{ProbeReport, probe_providers};
use crate::throttle::ChannelExchange;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

// -- Response types --

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct InstanceStatus {
    id: String,
    active_keys: Vec<ContextKey>,
    exchanges: Vec<ChannelExchange>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: u64,
    global_paused: bool,
    bot_interactions_paused: bool,
    concurrency: CoordinatorSnapshot,
    providers: Vec<ProviderStatusEntry>,
    instances: Vec<InstanceStatus>,
}

#[derive(Serialize)]
struct DiagnosticsResponse {
    providers: Vec<ProbeReport>,
}

#[derive(Serialize)]
struct ReloadResponse {
    reloaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ClearResponse {
    instance: String,
    channel_id: u64,
    discarded: usize,
}

/// Build the API router.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/diagnostics", get(diagnostics))
        .route("/config/reload", post(reload_config))
        .route(
            "/instances/{instance}/channels/{channel_id}/clear",
            post(clear_channel),
        );

    let app = Router::new().nest("/api", api_routes);
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics));

    app.layer(cors).with_state(state)
}

/// Start the HTTP server on the given address.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

// -- API handlers --

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let settings = state.runtime.settings();
    let mut instances: Vec<_> = state
        .orchestrators
        .values()
        .map(|orchestrator| InstanceStatus {
            id: orchestrator.id().to_string(),
            active_keys: orchestrator.active_keys(),
            exchanges: orchestrator.throttle().snapshot(),
        })
        .collect();
    instances.sort_by(|a, b| a.id.cmp(&b.id));

    Json(StatusResponse {
        status: "running",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        global_paused: settings.global_paused,
        bot_interactions_paused: settings.bot_interactions_paused,
        concurrency: state.coordinator.snapshot(),
        providers: state.chain.status_snapshot(),
        instances,
    })
}

async fn diagnostics(State(state): State<Arc<ApiState>>) -> Json<DiagnosticsResponse> {
    let providers = state.runtime.providers();
    let reports = probe_providers(&providers, state.chain.client().as_ref()).await;
    Json(DiagnosticsResponse { providers: reports })
}

async fn reload_config(State(state): State<Arc<ApiState>>) -> Response {
    match state.runtime.reload() {
        Ok(()) => Json(ReloadResponse {
            reloaded: true,
            error: None,
        })
        .into_response(),
        Err(error) => {
            tracing::warn!(%error, "config reload via API failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ReloadResponse {
                    reloaded: false,
                    error: Some(error.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn clear_channel(
    State(state): State<Arc<ApiState>>,
    Path((instance, channel_id)): Path<(String, u64)>,
) -> Response {
    let Some(orchestrator) = state.orchestrators.get(instance.as_str()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let discarded = orchestrator.clear_history(&ContextKey::channel(channel_id));
    Json(ClearResponse {
        instance,
        channel_id,
        discarded,
    })
    .into_response()
}

#[cfg(feature = "metrics")]
async fn metrics() -> Response {
    match crate::telemetry::render() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(error) => {
            tracing::warn!(%error, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
