//! WebSocket peer transport
//!
//! The speaker registers under a random peer id. A listener connects to
//! `/api/v1/peer?speakerPeerId=<id>`; each accepted socket becomes one data
//! connection for the session.
//!
//! Frames from the listener:
//! - text `{"name": ..., "payload": ...}` is forwarded to the session, except
//!   `call` (opens a call, payload `{sampleRate, encoding}`) and
//!   `recordingStopped` (final capture chunk was sent)
//! - binary frames are capture chunks, kept only while recording
//!
//! Frames to the listener:
//! - whatever the session sends, as text
//! - `answer` once the session answered a call
//! - `startRecording` / `stopRecording` around each captured round

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use speakercal_core::audio::device::{CaptureDevice, CaptureEvent, InboundStream, StreamEncoding};
use speakercal_core::audio::recorder::RecorderError;
use speakercal_core::peer::{
    CallLink, DataConnection, DataEvent, IncomingCall, Outbound, PeerControl, PeerEvent,
    MISSING_SPEAKER_ID,
};
use tokio::sync::{mpsc, oneshot};

use crate::AppState;

/// Capture rate assumed when a call does not announce one
const DEFAULT_CALL_SAMPLE_RATE: u32 = 48000;

struct HubInner {
    peer_id: Mutex<String>,
    events: mpsc::UnboundedSender<PeerEvent>,
    online: AtomicBool,
    connections: AtomicU64,
}

/// Registry the session's [`PeerEvent`]s come from
#[derive(Clone)]
pub struct PeerHub {
    inner: Arc<HubInner>,
}

impl PeerHub {
    /// Register under a fresh peer id; the returned receiver already holds
    /// the `Open` event
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        let hub = Self {
            inner: Arc::new(HubInner {
                peer_id: Mutex::new(id.clone()),
                events,
                online: AtomicBool::new(true),
                connections: AtomicU64::new(0),
            }),
        };
        tracing::info!(peer = %id, "Speaker peer registered");
        hub.emit(PeerEvent::Open(Some(id)));
        (hub, rx)
    }

    /// Current speaker peer id
    pub fn peer_id(&self) -> String {
        self.inner
            .peer_id
            .lock()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    /// Whether new listeners are accepted
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Sockets accepted so far
    pub fn connections(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// Control handle for the session
    pub fn control(&self) -> HubControl {
        HubControl { hub: self.clone() }
    }

    /// Stop accepting listeners and tell the session it was disconnected
    pub fn disconnect(&self) {
        self.inner.online.store(false, Ordering::Release);
        tracing::warn!("Speaker peer disconnected");
        self.emit(PeerEvent::Disconnected);
    }

    fn accepts(&self, id: Option<&str>) -> bool {
        self.is_online() && id == Some(self.peer_id().as_str())
    }

    fn emit(&self, event: PeerEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::debug!("No session listening for peer events");
        }
    }
}

/// [`PeerControl`] backed by a [`PeerHub`]
pub struct HubControl {
    hub: PeerHub,
}

impl PeerControl for HubControl {
    fn reconnect(&mut self, peer_id: &str) -> anyhow::Result<()> {
        let current = self.hub.peer_id();
        if peer_id != current {
            anyhow::bail!("peer id {} is not registered here", peer_id);
        }
        self.hub.inner.online.store(true, Ordering::Release);
        tracing::info!(peer = %peer_id, "Speaker peer reconnected");
        self.hub.emit(PeerEvent::Open(Some(peer_id.to_string())));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    #[serde(rename = "speakerPeerId")]
    pub speaker_peer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallPayload {
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    encoding: Option<StreamEncoding>,
}

/// GET /api/v1/peer (WebSocket upgrade)
pub async fn peer_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<PeerQuery>,
    State(state): State<AppState>,
) -> Response {
    let hub = state.hub.clone();
    if !hub.accepts(query.speaker_peer_id.as_deref()) {
        tracing::warn!(requested = ?query.speaker_peer_id, "Refusing listener without a valid speaker id");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "name": MISSING_SPEAKER_ID,
                "payload": "No speaker with this peer id is waiting for a listener",
            })),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Commands from the capture device to its socket
enum CaptureControl {
    Start(mpsc::UnboundedSender<CaptureEvent>),
    Stop,
}

/// Capture device fed by the listener's binary frames
pub struct WsCapture {
    control: mpsc::UnboundedSender<CaptureControl>,
}

impl CaptureDevice for WsCapture {
    fn start(&mut self, sink: mpsc::UnboundedSender<CaptureEvent>) -> Result<(), RecorderError> {
        self.control
            .send(CaptureControl::Start(sink))
            .map_err(|_| RecorderError::Device("listener disconnected".into()))
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        // A closed socket already dropped the sink, which ends the capture
        let _ = self.control.send(CaptureControl::Stop);
        Ok(())
    }
}

struct PendingCall {
    answered: oneshot::Receiver<()>,
    stream: oneshot::Sender<InboundStream>,
    sample_rate: u32,
    encoding: StreamEncoding,
}

async fn handle_socket(socket: WebSocket, hub: PeerHub) {
    let n = hub.inner.connections.fetch_add(1, Ordering::Relaxed) + 1;
    let conn_id = format!("listener-{}", n);
    let (conn, link) = DataConnection::channel(&conn_id);
    let events = link.events;
    let mut outbound = link.outbound;

    tracing::info!(peer = %conn_id, "Listener connected");
    hub.emit(PeerEvent::Connection(conn));
    let _ = events.send(DataEvent::Open);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (capture_tx, mut capture_rx) = mpsc::unbounded_channel::<CaptureControl>();
    let mut capture_sink: Option<mpsc::UnboundedSender<CaptureEvent>> = None;
    let mut pending: Option<PendingCall> = None;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let value = serde_json::from_str::<Value>(text.as_str())
                            .unwrap_or_else(|_| Value::String(text.as_str().to_owned()));
                        match value.get("name").and_then(Value::as_str) {
                            Some("call") => {
                                let payload: CallPayload = value
                                    .get("payload")
                                    .cloned()
                                    .and_then(|p| serde_json::from_value(p).ok())
                                    .unwrap_or(CallPayload { sample_rate: None, encoding: None });
                                let (call, CallLink { answered, stream }) = IncomingCall::channel(&conn_id);
                                pending = Some(PendingCall {
                                    answered,
                                    stream,
                                    sample_rate: payload.sample_rate.unwrap_or(DEFAULT_CALL_SAMPLE_RATE),
                                    encoding: payload.encoding.unwrap_or(StreamEncoding::Wav),
                                });
                                tracing::info!(peer = %conn_id, "Listener calling");
                                hub.emit(PeerEvent::Call(call));
                            }
                            Some("recordingStopped") => {
                                if let Some(sink) = capture_sink.take() {
                                    let _ = sink.send(CaptureEvent::Stopped);
                                }
                            }
                            _ => {
                                let _ = events.send(DataEvent::Data(value));
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Some(sink) = &capture_sink {
                            let _ = sink.send(CaptureEvent::Data(bytes.to_vec()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(peer = %conn_id, error = %e, "Listener socket error");
                        break;
                    }
                }
            }

            out = outbound.recv() => {
                match out {
                    Some(Outbound::Send(value)) => {
                        if ws_sender.send(Message::Text(value.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            Some(control) = capture_rx.recv() => {
                let name = match control {
                    CaptureControl::Start(sink) => {
                        capture_sink = Some(sink);
                        "startRecording"
                    }
                    CaptureControl::Stop => "stopRecording",
                };
                let frame = json!({"name": name, "payload": null}).to_string();
                if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            answered = wait_answer(&mut pending) => {
                let Some(call) = pending.take() else { continue };
                if answered.is_err() {
                    tracing::debug!(peer = %conn_id, "Call dropped unanswered");
                    continue;
                }
                let stream = InboundStream::new(
                    conn_id.clone(),
                    call.sample_rate,
                    call.encoding,
                    Box::new(WsCapture { control: capture_tx.clone() }),
                );
                let _ = call.stream.send(stream);
                let frame = json!({"name": "answer", "payload": null}).to_string();
                if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(sink) = capture_sink.take() {
        let _ = sink.send(CaptureEvent::Stopped);
    }
    let _ = events.send(DataEvent::Close);
    tracing::info!(peer = %conn_id, "Listener disconnected");
}

async fn wait_answer(pending: &mut Option<PendingCall>) -> Result<(), oneshot::error::RecvError> {
    match pending {
        Some(call) => (&mut call.answered).await,
        None => std::future::pending().await,
    }
}
