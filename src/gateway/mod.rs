//! HTTP gateway: the chat endpoint that drives the agent loop and streams
//! its progress back to a chat UI.

pub mod data_stream;

use crate::agent::{
    agent_turn, prune, to_chat_messages, trim, AgentEvent, RunSettings, UiMessage, SYSTEM_PROMPT,
};
use crate::config::Config;
use crate::desktop::{create_sandbox_service, SandboxService};
use crate::observability::{create_observer, Observer, ObserverEvent};
use crate::providers::{create_provider, ChatMessage, Provider};
use crate::tools::{tools_for_sandbox, Tool};
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn Provider>,
    pub sandboxes: Arc<dyn SandboxService>,
    pub observer: Arc<dyn Observer>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub messages: Vec<UiMessage>,
    #[serde(default)]
    pub sandbox_id: String,
}

/// Everything a run needs, built before the response is committed.
struct PreparedRun {
    history: Vec<ChatMessage>,
    tools: Vec<Box<dyn Tool>>,
    settings: RunSettings,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub fn router(state: AppState) -> Router {
    let max_body = state.config.gateway.max_body_bytes;
    // Bounds time-to-headers only; streamed runs carry their own deadline.
    let timeout = Duration::from_secs(state.config.gateway.request_timeout_secs);
    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .with_state(state)
}

fn prepare_run(
    config: &Config,
    sandboxes: Arc<dyn SandboxService>,
    sandbox_id: &str,
    mut messages: Vec<UiMessage>,
) -> Result<PreparedRun> {
    prune(&mut messages);
    trim(&mut messages, config.agent.max_history_messages);
    let history =
        to_chat_messages(SYSTEM_PROMPT, &messages).context("Failed to convert chat history")?;
    Ok(PreparedRun {
        history,
        tools: tools_for_sandbox(sandbox_id, sandboxes),
        settings: RunSettings {
            model: config.provider.model.clone(),
            temperature: config.provider.temperature,
            max_steps: config.agent.max_steps,
        },
    })
}

/// POST /api/chat
async fn handle_chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    let sandbox_id = body.sandbox_id.trim().to_string();
    if sandbox_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "sandboxId is required");
    }

    match prepare_run(&state.config, Arc::clone(&state.sandboxes), &sandbox_id, body.messages) {
        Ok(run) => {
            tracing::info!(sandbox = %sandbox_id, messages = run.history.len(), "Chat run started");
            state.observer.record_event(&ObserverEvent::ChatStarted {
                sandbox_id: sandbox_id.clone(),
            });
            stream_run(state, run)
        }
        Err(e) => {
            tracing::error!(sandbox = %sandbox_id, "Chat API error: {e:#}");
            state.observer.record_event(&ObserverEvent::ChatFailed {
                sandbox_id: sandbox_id.clone(),
            });
            if let Err(kill_err) = state.sandboxes.kill(&sandbox_id).await {
                tracing::warn!(sandbox = %sandbox_id, "Sandbox cleanup failed: {kill_err}");
            }
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn stream_run(state: AppState, run: PreparedRun) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<AgentEvent>();
    let timeout_secs = state.config.gateway.request_timeout_secs;

    tokio::spawn(async move {
        let PreparedRun {
            mut history,
            tools,
            settings,
        } = run;
        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            agent_turn(
                state.provider.as_ref(),
                &mut history,
                &tools,
                state.observer.as_ref(),
                &settings,
                &tx,
            ),
        )
        .await;
        if outcome.is_err() {
            let message = format!("Run timed out after {timeout_secs}s");
            tracing::warn!("{message}");
            state.observer.record_event(&ObserverEvent::RunError {
                message: message.clone(),
            });
            let _ = tx.send(AgentEvent::Error(message));
        }
    });

    let lines = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(data_stream::encode(&event)), rx))
    });

    (
        [
            (header::CONTENT_TYPE, data_stream::CONTENT_TYPE),
            (
                HeaderName::from_static(data_stream::STREAM_HEADER),
                data_stream::STREAM_VERSION,
            ),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": env!("DESKPILOT_GIT_SHA"),
        "built_at": env!("DESKPILOT_BUILD_TIME"),
        "model": state.config.provider.model,
        "observer": state.observer.name(),
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
    }))
}

/// GET /metrics
async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.observer.export() {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Metrics are not enabled"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down gateway");
}

/// Bind and serve until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let provider: Arc<dyn Provider> = Arc::from(create_provider(&config.provider));
    let sandboxes: Arc<dyn SandboxService> = Arc::new(create_sandbox_service(&config.sandbox));
    let observer: Arc<dyn Observer> = Arc::from(create_observer(&config.observability));

    if config.provider.api_key.is_none() {
        tracing::warn!("No model API key configured; chat requests will fail until one is set");
    }
    if config.sandbox.api_key.is_none() {
        tracing::warn!("No sandbox API key configured; desktop actions will fail until one is set");
    }

    let warm = Arc::clone(&provider);
    tokio::spawn(async move {
        if let Err(e) = warm.warmup().await {
            tracing::warn!("Provider warmup failed: {e}");
        }
    });

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    tracing::info!(
        "Gateway listening on http://{} (model {}, observer {})",
        listener.local_addr()?,
        config.provider.model,
        observer.name()
    );

    let state = AppState {
        config: Arc::new(config),
        provider,
        sandboxes,
        observer,
        started_at: chrono::Utc::now(),
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server error")?;
    Ok(())
}
