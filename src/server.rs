//! HTTP surface: diagnostic routes plus the forwarding fallback.
//!
//! `/status` and `/next-backend` are answered locally; every other method and
//! path is forwarded through the [`Dispatcher`].

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::Settings;
use crate::error::ProxyError;
use crate::proxy::Dispatcher;

/// Shared state of the HTTP handlers.
pub struct AppState {
    dispatcher: Dispatcher,
    settings: Settings,
    start_time: String,
}

impl AppState {
    /// Creates handler state, stamping the start time.
    #[must_use]
    pub fn new(dispatcher: Dispatcher, settings: Settings) -> Self {
        Self {
            dispatcher,
            settings,
            start_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// The dispatcher requests are forwarded through.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Body of `GET /status`.
#[derive(Debug, Serialize)]
struct StatusResponse<'a> {
    podname: &'a str,
    podip: &'a str,
    servicename: &'a str,
    backendport: String,
    loadbalancerport: u16,
    loadbalancermethod: &'static str,
    connectedhosts: usize,
    starttime: &'a str,
}

/// Body of `GET /next-backend`.
#[derive(Debug, Serialize)]
struct NextResponse {
    nexthost: String,
    identity: String,
}

/// Builds the balancer's router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/next-backend", get(next_backend))
        .fallback(forward)
        .with_state(state)
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    let settings = &state.settings;

    Json(StatusResponse {
        podname: &settings.pod_name,
        podip: &settings.pod_ip,
        servicename: &settings.backend_name,
        backendport: settings.backend_port.to_string(),
        loadbalancerport: settings.listen_port,
        loadbalancermethod: settings.strategy.name(),
        connectedhosts: state.dispatcher.registry().len(),
        starttime: &state.start_time,
    })
    .into_response()
}

async fn next_backend(State(state): State<Arc<AppState>>) -> Response {
    match state.dispatcher.peek() {
        Some(backend) => Json(NextResponse {
            nexthost: backend.address.to_string(),
            identity: backend.identity,
        })
        .into_response(),

        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": ProxyError::NoBackends.to_string() })),
        )
            .into_response(),
    }
}

async fn forward(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();

    match state.dispatcher.forward(req).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("proxy error for {method} {uri}: {e}");
            e.into_response()
        }
    }
}
