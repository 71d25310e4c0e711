//! Subscriber-facing WebSocket server.
//!
//! Thin glue around the relay: accepts WebSocket subscribers, authenticates
//! them against the configured token, and forwards their join/leave commands
//! to the pool. No upstream error ever surfaces to a subscriber.

pub mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::relay::Relay;

/// Shared state handed to the WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub basic_auth: Option<String>,
}

/// Build the subscriber-facing router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(state: AppState, addr: &str, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind {addr}: {e}")))?;
    info!(
        "Danmaku relay server is listening at {}",
        listener.local_addr()?
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
