//! HTTP surface: health and sequencer introspection.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::channels::ChannelManager;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::sequencer::{KeySnapshot, SequencerStats};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    channels: Arc<ChannelManager>,
}

#[derive(Debug, Serialize)]
struct SequencerView {
    #[serde(flatten)]
    stats: SequencerStats,
    keys: Vec<KeySnapshot>,
}

/// Health and introspection routes. Merge channel routers into the result
/// before serving.
pub fn routes(dispatcher: Arc<Dispatcher>, channels: Arc<ChannelManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sequencer", get(sequencer))
        .with_state(AppState {
            dispatcher,
            channels,
        })
}

/// Serve `app` on `listener` with permissive CORS until the listener fails.
pub async fn serve(listener: TcpListener, app: Router) -> Result<(), Error> {
    let app = app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Server(e.to_string()))
}

/// `status` is `degraded` when any channel fails its health check.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.dispatcher.stats();
    let channels: BTreeMap<String, bool> =
        state.channels.health_check_all().await.into_iter().collect();
    let status = if channels.values().all(|ok| *ok) {
        "ok"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "status": status,
        "channels": channels,
        "version": env!("CARGO_PKG_VERSION"),
        "active_keys": stats.active_keys,
        "pending_tasks": stats.pending_tasks,
    }))
}

async fn sequencer(State(state): State<AppState>) -> impl IntoResponse {
    Json(SequencerView {
        stats: state.dispatcher.stats(),
        keys: state.dispatcher.snapshot(),
    })
}
