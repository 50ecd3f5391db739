//! Liveness endpoint and webhook receiver.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use mpb_bot::Update;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mpb-web";

pub const LIVENESS_BODY: &str = "Bot is running";

pub const WEBHOOK_PATH: &str = "/telegram";

/// Header Telegram echoes back when the webhook was registered with a secret.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Debug, Clone, Default)]
pub struct AppState {
    updates: Option<mpsc::Sender<Update>>,
    webhook_secret: Option<String>,
}

impl AppState {
    pub fn liveness_only() -> Self {
        Self::default()
    }

    pub fn with_webhook(updates: mpsc::Sender<Update>, webhook_secret: Option<String>) -> Self {
        Self {
            updates: Some(updates),
            webhook_secret,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness_handler))
        .route("/healthz", get(liveness_handler))
        .route(WEBHOOK_PATH, post(webhook_handler))
        .with_state(Arc::new(state))
}

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "liveness server listening");
    Ok(listener)
}

/// Serves until `cancel` fires, then drains open connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("liveness server stopped");
    Ok(())
}

async fn liveness_handler() -> &'static str {
    LIVENESS_BODY
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode {
    let Some(updates) = state.updates.as_ref() else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(expected) = state.webhook_secret.as_deref() {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            warn!("rejecting webhook call with a missing or wrong secret");
            return StatusCode::UNAUTHORIZED;
        }
    }
    match updates.send(update).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
