//! Web server: WebSocket report feed and status API.
//!
//! Shared state is the broadcast registry (outlives service generations), a
//! view of the current supervisor state, and the process shutdown token that
//! ends every subscriber loop.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use flarm_core::config::TlsFiles;

use crate::registry::BroadcastRegistry;
use crate::supervisor::SupervisorState;

pub mod routes;

/// Time open TLS connections get to finish after shutdown.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub registry: Arc<BroadcastRegistry>,
    pub supervisor_state: watch::Receiver<SupervisorState>,
    /// Incremented at each service generation start.
    pub generation: AtomicU64,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        registry: Arc<BroadcastRegistry>,
        supervisor_state: watch::Receiver<SupervisorState>,
        shutdown: CancellationToken,
    ) -> Self {
        AppState {
            registry,
            supervisor_state,
            generation: AtomicU64::new(0),
            shutdown,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", axum::routing::get(routes::ws_subscribe))
        .route("/api/v1/status", axum::routing::get(routes::api_status))
        .with_state(state)
        .layer(cors)
}

/// Serve until the shutdown token fires.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "FLARM server listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Serve HTTPS with a PEM certificate chain and key until the shutdown token
/// fires.
pub async fn serve_tls(
    listener: TcpListener,
    state: Arc<AppState>,
    tls: &TlsFiles,
) -> std::io::Result<()> {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;

    let shutdown = state.shutdown.clone();
    let app = build_router(state);
    let listener = listener.into_std()?;

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, cert = %tls.cert.display(), "FLARM server listening (TLS)");
    }

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
        }
    });

    axum_server::from_tcp_rustls(listener, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}
