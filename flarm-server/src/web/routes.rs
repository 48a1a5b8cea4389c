//! Route handlers.
//!
//! `/ws` turns each WebSocket client into a registry subscriber: every queued
//! report goes out as one text frame until the client leaves, a write fails,
//! the registry drops the subscriber, or the server shuts down.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use crate::web::AppState;

/// GET /api/v1/status
pub async fn api_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    let supervisor = *state.supervisor_state.borrow();

    Json(json!({
        "state": supervisor,
        "generation": state.generation.load(Ordering::Relaxed),
        "subscribers": stats.subscribers,
        "published": stats.published,
        "dropped": stats.dropped,
        "removed": stats.removed,
    }))
}

/// GET /ws
pub async fn ws_subscribe(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| subscriber_loop(socket, state))
}

async fn subscriber_loop(socket: WebSocket, state: Arc<AppState>) {
    let (handle, mut queue) = state.registry.register();
    info!(%handle, "subscriber connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            msg = queue.recv() => {
                let Some(text) = msg else { break };
                // A client that stopped reading must not outlive shutdown.
                let sent = tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    sent = ws_tx.send(Message::Text(text.to_string())) => sent,
                };
                if sent.is_err() {
                    debug!(%handle, "write failed");
                    break;
                }
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.unregister(&handle);
    info!(%handle, "subscriber disconnected");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
