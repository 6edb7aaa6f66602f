//! Single-connection handshake with a deadline
//!
//! [`Speaker::start_calibration`] drives one attempt:
//!
//! ```text
//! Open -> AwaitingConnection -> Connected -> Ready -> {Closed, Disconnected, Error}
//! ```
//!
//! - Only one data connection is honoured. Later ones get
//!   [`BUSY_NOTICE`](super::BUSY_NOTICE) and are closed after the busy grace
//!   period; the active one is untouched.
//! - An incoming call is answered receive-only, and only when it comes from
//!   the active connection. Calibration starts once the inbound stream is
//!   live and the far end announced its sample rate.
//! - When the active connection closes before a call, the next listener has
//!   to announce its own rate.
//! - The whole attempt is bounded by a deadline. When it fires, the
//!   calibration task is aborted and awaited (its MLS handle is released on
//!   drop) and the attempt fails with `CalibrationTimedOutError`.
//! - Malformed data-channel messages are logged and dropped.
//! - A disconnection triggers one reconnect under the last peer id; a failed
//!   reconnect ends the attempt with a connection error.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use super::{
    ConnectionState, DataConnection, DataEvent, IncomingCall, PeerControl, PeerEvent,
    PeerMessage, BUSY_NOTICE, MISSING_SPEAKER_ID, SAMPLING_RATE, UNSUPPORTED_DEVICE,
};
use crate::calibration::{CalibrationError, Calibrator, SampleRates};
use crate::config::CalibrationConfig;

/// Errors that end (or, for malformed messages, are logged by) a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Calibration failed to produce a result after {} seconds. Please try again.", .timeout.as_secs_f64())]
    TimedOut { timeout: Duration },

    #[error("Far end never announced its sample rate")]
    MissingSampleRate,

    #[error("Received malformed data: {0}")]
    MalformedMessage(String),

    #[error("Listener device is not supported: {0}")]
    UnsupportedDevice(String),

    #[error("Listener is missing the speaker id: {0}")]
    MissingSpeakerId(String),

    #[error("Peer connection error: {0}")]
    Connection(String),

    #[error("Call ended before its stream arrived")]
    CallDropped,

    #[error("Peer transport closed")]
    TransportClosed,

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("Calibration task failed: {0}")]
    TaskFailed(String),
}

impl SessionError {
    /// Taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TimedOut { .. } => "CalibrationTimedOutError",
            Self::MissingSampleRate => "MissingSampleRateError",
            Self::MalformedMessage(_) => "MalformedMessageError",
            Self::UnsupportedDevice(_) => "UnsupportedDeviceError",
            Self::MissingSpeakerId(_) => "MissingSpeakerIdError",
            Self::Connection(_) => "ConnectionError",
            Self::CallDropped => "CallDroppedError",
            Self::TransportClosed => "TransportClosedError",
            Self::Calibration(e) => e.kind(),
            Self::TaskFailed(_) => "CalibrationTaskError",
        }
    }
}

/// Timing of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerOptions {
    /// Deadline for the whole attempt
    pub timeout: Duration,
    /// Delay before a second connection is closed
    pub busy_grace: Duration,
}

impl Default for SpeakerOptions {
    fn default() -> Self {
        Self::from(&CalibrationConfig::default())
    }
}

impl From<&CalibrationConfig> for SpeakerOptions {
    fn from(config: &CalibrationConfig) -> Self {
        Self {
            timeout: config.timeout(),
            busy_grace: config.busy_grace(),
        }
    }
}

/// Far-end sample rate as seen by a waiting calibration task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkRate {
    Pending,
    Known(u32),
    Gone,
}

/// Speaker side of the peer connection
pub struct Speaker<P: PeerControl> {
    control: P,
    options: SpeakerOptions,
    peer_id: Option<String>,
    state: watch::Sender<ConnectionState>,
}

impl<P: PeerControl> Speaker<P> {
    pub fn new(control: P, options: SpeakerOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        Self {
            control,
            options,
            peer_id: None,
            state,
        }
    }

    /// Follow handshake state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Last peer id the transport announced
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Connection state");
            *current = state;
            true
        });
    }

    /// Run one calibration attempt
    ///
    /// Resolves with the calibrator's output, or with the first fatal error.
    /// The deadline starts now and covers waiting for the call as well.
    pub async fn start_calibration<C: Calibrator>(
        &mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        calibrator: C,
    ) -> Result<C::Output, SessionError> {
        let timeout = self.options.timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let started = Instant::now();

        let mut calibrator = Some(calibrator);
        let mut task: Option<JoinHandle<Result<C::Output, SessionError>>> = None;
        let mut active: Option<DataConnection> = None;
        let (sink_rate, _) = watch::channel(SinkRate::Pending);
        let mut events_open = true;
        let mut reconnecting = false;

        tracing::info!(timeout_ms = timeout.as_millis() as u64, "Waiting for listener");

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    tracing::warn!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Calibration deadline reached"
                    );
                    break Err(SessionError::TimedOut { timeout });
                }

                joined = join_task(&mut task) => {
                    task = None;
                    break flatten(joined);
                }

                event = recv_data(&mut active) => {
                    if let Err(e) = self.on_data_event(event, &mut active, &sink_rate, task.is_some()) {
                        break Err(e);
                    }
                }

                event = events.recv(), if events_open => {
                    let Some(event) = event else {
                        // No call can arrive any more; a running task may still finish
                        if task.is_none() {
                            break Err(SessionError::TransportClosed);
                        }
                        tracing::warn!("Peer event channel closed");
                        events_open = false;
                        continue;
                    };
                    match event {
                        PeerEvent::Open(id) => {
                            reconnecting = false;
                            self.on_open(id, active.is_some());
                        }
                        PeerEvent::Connection(conn) => self.on_connection(conn, &mut active),
                        PeerEvent::Call(call) => {
                            let from_active = active.as_ref().is_some_and(|conn| conn.id() == call.peer());
                            if !from_active {
                                tracing::warn!(peer = call.peer(), "Ignoring call from a peer without the active connection");
                                continue;
                            }
                            match calibrator.take() {
                                Some(calibrator) => {
                                    task = Some(spawn_calibration(call, calibrator, sink_rate.subscribe()));
                                }
                                None => {
                                    tracing::warn!(peer = call.peer(), "Calibration already running, ignoring call");
                                }
                            }
                        }
                        PeerEvent::Close => {
                            tracing::info!("Peer destroyed");
                            if active.take().is_some() {
                                connection_lost(&sink_rate, task.is_some());
                            }
                            self.set_state(ConnectionState::Closed);
                        }
                        PeerEvent::Disconnected => {
                            self.set_state(ConnectionState::Disconnected);
                            if let Err(e) = self.reconnect() {
                                break Err(e);
                            }
                            reconnecting = true;
                        }
                        PeerEvent::Error(message) => {
                            tracing::error!(error = %message, "Peer error");
                            self.set_state(ConnectionState::Error);
                            if reconnecting {
                                break Err(SessionError::Connection(message));
                            }
                        }
                    }
                }
            }
        };

        if let Some(task) = task.take() {
            task.abort();
            // Wait for the aborted future to be dropped so its handle is released
            let _ = task.await;
            tracing::debug!("Calibration task aborted");
        }

        match &outcome {
            Ok(_) => tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Calibration finished"
            ),
            Err(e) => tracing::error!(kind = e.kind(), error = %e, "Calibration attempt failed"),
        }
        outcome
    }

    fn on_open(&mut self, id: Option<String>, connected: bool) {
        match id {
            Some(id) => {
                tracing::info!(peer = %id, "Peer open");
                self.peer_id = Some(id);
            }
            None => {
                tracing::warn!(last = ?self.peer_id, "Peer opened without an id, keeping the last one");
            }
        }
        if !connected {
            self.set_state(ConnectionState::Open);
            self.set_state(ConnectionState::AwaitingConnection);
        }
    }

    fn on_connection(&self, conn: DataConnection, active: &mut Option<DataConnection>) {
        if active.is_some() {
            tracing::info!(peer = conn.id(), "Refusing second connection");
            tokio::spawn(refuse_busy(conn, self.options.busy_grace));
            return;
        }

        tracing::info!(peer = conn.id(), "Connected");
        self.set_state(ConnectionState::Connected);
        *active = Some(conn);
        self.set_state(ConnectionState::Ready);
    }

    fn on_data_event(
        &self,
        event: Option<DataEvent>,
        active: &mut Option<DataConnection>,
        sink_rate: &watch::Sender<SinkRate>,
        calibrating: bool,
    ) -> Result<(), SessionError> {
        match event {
            Some(DataEvent::Open) => {
                tracing::debug!("Data channel open");
                Ok(())
            }
            Some(DataEvent::Data(value)) => self.on_message(&value, sink_rate),
            Some(DataEvent::Close) | None => {
                tracing::info!("Connection reset, awaiting connection");
                *active = None;
                connection_lost(sink_rate, calibrating);
                self.set_state(ConnectionState::Closed);
                self.set_state(ConnectionState::AwaitingConnection);
                Ok(())
            }
        }
    }

    fn on_message(&self, value: &Value, sink_rate: &watch::Sender<SinkRate>) -> Result<(), SessionError> {
        let message = match PeerMessage::parse(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping data-channel message");
                return Ok(());
            }
        };

        match message.name.as_str() {
            SAMPLING_RATE => {
                match message.sampling_rate() {
                    Some(rate) => {
                        tracing::info!(sink_rate = rate, "Far-end sample rate announced");
                        sink_rate.send_replace(SinkRate::Known(rate));
                    }
                    None => tracing::warn!(payload = %message.payload, "Dropping invalid sample rate"),
                }
                Ok(())
            }
            UNSUPPORTED_DEVICE => Err(SessionError::UnsupportedDevice(payload_text(&message.payload))),
            MISSING_SPEAKER_ID => Err(SessionError::MissingSpeakerId(payload_text(&message.payload))),
            other => {
                tracing::debug!(name = other, "Ignoring data-channel message");
                Ok(())
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), SessionError> {
        let id = self
            .peer_id
            .clone()
            .ok_or_else(|| SessionError::Connection("disconnected before a peer id was issued".into()))?;
        tracing::info!(peer = %id, "Connection lost, reconnecting");
        self.control
            .reconnect(&id)
            .map_err(|e| SessionError::Connection(format!("{:#}", e)))
    }
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

/// A waiting calibration sees the rate as gone; otherwise the next listener
/// has to announce its own rate.
fn connection_lost(sink_rate: &watch::Sender<SinkRate>, calibrating: bool) {
    if !calibrating {
        sink_rate.send_replace(SinkRate::Pending);
        return;
    }
    sink_rate.send_if_modified(|rate| {
        if *rate == SinkRate::Pending {
            *rate = SinkRate::Gone;
            true
        } else {
            false
        }
    });
}

fn join_task<T>(
    task: &mut Option<JoinHandle<T>>,
) -> impl Future<Output = Result<T, JoinError>> + '_ {
    async move {
        match task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    }
}

fn recv_data(active: &mut Option<DataConnection>) -> impl Future<Output = Option<DataEvent>> + '_ {
    async move {
        match active {
            Some(conn) => conn.recv().await,
            None => std::future::pending().await,
        }
    }
}

fn flatten<T>(joined: Result<Result<T, SessionError>, JoinError>) -> Result<T, SessionError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(SessionError::TaskFailed(e.to_string())),
    }
}

async fn refuse_busy(mut conn: DataConnection, grace: Duration) {
    loop {
        match conn.recv().await {
            Some(DataEvent::Open) => break,
            Some(DataEvent::Data(_)) => continue,
            Some(DataEvent::Close) | None => return,
        }
    }
    conn.send(Value::String(BUSY_NOTICE.into()));
    tokio::time::sleep(grace).await;
    conn.close();
    tracing::debug!(peer = conn.id(), "Second connection closed");
}

fn spawn_calibration<C: Calibrator>(
    call: IncomingCall,
    calibrator: C,
    mut sink_rate: watch::Receiver<SinkRate>,
) -> JoinHandle<Result<C::Output, SessionError>> {
    tracing::info!(peer = call.peer(), "Answering call");
    let answered = call.answer();

    tokio::spawn(async move {
        let stream = answered.stream().await?;
        tracing::info!(stream = stream.id(), "Inbound stream live");

        let announced = sink_rate
            .wait_for(|rate| *rate != SinkRate::Pending)
            .await
            .map(|rate| *rate);
        let sink = match announced {
            Ok(SinkRate::Known(rate)) => rate,
            _ => return Err(SessionError::MissingSampleRate),
        };

        let rates = SampleRates {
            source: calibrator.playback_sample_rate(),
            sink,
        };
        Ok(calibrator.calibrate(stream, rates).await?)
    })
}
