//! HTTP gateway for agentwire.
//!
//! A thin axum binding around the transport-agnostic session core:
//!
//! - `GET /health`: liveness plus the live session count
//! - `GET /v1/sessions`: snapshots of every live session
//! - `GET /v1/ws`: WebSocket upgrade; `?session_id=` re-attaches
//!
//! [`serve`] runs the router until Ctrl-C, then drains every session through
//! the registry before the listener stops.

pub mod ws;

use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use agentwire_core::error::ErrorCode;
use agentwire_session::{SessionManager, SessionSnapshot};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub manager: Arc<SessionManager>,
}

type SharedState = Arc<GatewayState>;

/// Build the router with all gateway routes.
pub fn build_router(manager: Arc<SessionManager>) -> Router {
    let state = Arc::new(GatewayState { manager });
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/sessions", get(list_sessions_handler))
        .route("/v1/ws", get(ws::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(manager: Arc<SessionManager>) -> std::io::Result<()> {
    let gateway = &manager.config().gateway;
    let addr = format!("{}:{}", gateway.host, gateway.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    serve_with_shutdown(listener, manager, ctrl_c()).await
}

/// Serve on an already bound listener until `signal` resolves, then shut
/// every session down (bounded by the configured grace) and stop.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(manager.registry());
    // Sessions get their grace period plus a little to flush and deregister.
    let wait = manager.config().session.shutdown_grace() + Duration::from_secs(1);
    let app = build_router(manager);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!(sessions = registry.len(), "Shutdown requested");
            if !registry.shutdown(wait).await {
                warn!("Stopping with sessions still open");
            }
        })
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let registry = state.manager.registry();
    Json(HealthResponse {
        status: if registry.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        version: env!("CARGO_PKG_VERSION"),
        sessions: registry.len(),
    })
}

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionSnapshot>,
    count: usize,
}

async fn list_sessions_handler(State(state): State<SharedState>) -> Json<SessionListResponse> {
    let sessions = state.manager.registry().list();
    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
    pub number: u16,
}
