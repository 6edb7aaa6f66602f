//! REST API endpoints for speakercal
//!
//! All endpoints are under /api/v1/ and return JSON.

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;
use speakercal_core::peer::ConnectionState;

use crate::{AppState, Outcome};

/// Application status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub peer_id: String,
    pub online: bool,
    pub state: ConnectionState,
    pub connections: u64,
    pub last_outcome: Option<Outcome>,
}

/// Listener URL response
#[derive(Serialize)]
pub struct ListenerUrlResponse {
    pub url: String,
    pub peer_id: String,
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let last_outcome = state
        .last_outcome
        .lock()
        .ok()
        .and_then(|last| last.clone());

    Json(StatusResponse {
        version: speakercal_core::VERSION.to_string(),
        peer_id: state.hub.peer_id(),
        online: state.hub.is_online(),
        state: *state.connection.borrow(),
        connections: state.hub.connections(),
        last_outcome,
    })
}

/// GET /api/v1/listener-url
///
/// Address a listener on the local network connects its WebSocket to.
pub async fn get_listener_url(State(state): State<AppState>) -> Json<ListenerUrlResponse> {
    let peer_id = state.hub.peer_id();
    Json(ListenerUrlResponse {
        url: local_listener_url(state.config.port, &peer_id),
        peer_id,
    })
}

/// Listener URL on this machine's LAN address
pub fn local_listener_url(port: u16, peer_id: &str) -> String {
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    listener_url(&ip, port, peer_id)
}

fn listener_url(host: &str, port: u16, peer_id: &str) -> String {
    format!("ws://{}:{}/api/v1/peer?speakerPeerId={}", host, port, peer_id)
}
