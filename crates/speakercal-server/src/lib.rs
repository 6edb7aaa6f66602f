//! Speakercal Server - Axum WebSocket peer transport
//!
//! Listeners (the device with the microphone) connect over a WebSocket to
//! the speaker's peer id. The session in `speakercal-core` sees them through
//! the [`peer::PeerHub`] event channel.

pub mod api;
pub mod peer;

use std::sync::{Arc, Mutex};

use axum::http::{header, HeaderValue};
use axum::Router;
use serde::Serialize;
use speakercal_core::peer::ConnectionState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

pub use peer::{HubControl, PeerHub};

/// How the last calibration attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub success: bool,
    /// Error kind name on failure
    pub kind: Option<String>,
    pub message: String,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            kind: None,
            message: message.into(),
            finished_at: chrono::Utc::now(),
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind: Some(kind.into()),
            message: message.into(),
            finished_at: chrono::Utc::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// Speaker peer registry
    pub hub: PeerHub,
    /// Handshake state of the running session
    pub connection: watch::Receiver<ConnectionState>,
    /// Result of the last finished attempt
    pub last_outcome: Arc<Mutex<Option<Outcome>>>,
    /// Server configuration
    pub config: ServerConfig,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8930,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    pub fn new(
        hub: PeerHub,
        connection: watch::Receiver<ConnectionState>,
        config: ServerConfig,
    ) -> Self {
        Self {
            hub,
            connection,
            last_outcome: Arc::new(Mutex::new(None)),
            config,
        }
    }

    /// Publish the result of an attempt on the status endpoint
    pub fn record_outcome(&self, outcome: Outcome) {
        if let Ok(mut last) = self.last_outcome.lock() {
            *last = Some(outcome);
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", axum::routing::get(api::get_status))
        .route(
            "/api/v1/listener-url",
            axum::routing::get(api::get_listener_url),
        )
        .route("/api/v1/peer", axum::routing::get(peer::peer_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the web server
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, peer = %state.hub.peer_id(), "Speakercal server listening");

    serve(listener, state).await
}
