//! Peer transport seam
//!
//! The session never talks to a transport directly. A transport delivers
//! [`PeerEvent`]s over a channel and hands out [`DataConnection`]s and
//! [`IncomingCall`]s whose other ends ([`DataLink`], [`CallLink`]) it keeps.
//! Reconnecting is requested through [`PeerControl`].

pub mod session;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::audio::device::InboundStream;
pub use session::{SessionError, Speaker, SpeakerOptions};

/// Message sent to a second client while a session is active
pub const BUSY_NOTICE: &str = "Already connected to another client";

/// Name of the data-channel message announcing the far-end capture rate
pub const SAMPLING_RATE: &str = "samplingRate";

/// Far-end error message names that end the session
pub const UNSUPPORTED_DEVICE: &str = "UnsupportedDeviceError";
pub const MISSING_SPEAKER_ID: &str = "MissingSpeakerIdError";

/// Event raised by the peer transport
#[derive(Debug)]
pub enum PeerEvent {
    /// Registered with the signalling side; `None` after some reconnects
    Open(Option<String>),
    /// A listener opened a data connection
    Connection(DataConnection),
    /// A listener is calling with its microphone
    Call(IncomingCall),
    /// The peer was destroyed
    Close,
    /// Lost the signalling connection
    Disconnected,
    Error(String),
}

/// Event on one data connection
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    Open,
    Data(Value),
    Close,
}

/// Request from the session to the transport for one data connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send(Value),
    Close,
}

/// Session side of a data connection
#[derive(Debug)]
pub struct DataConnection {
    id: String,
    events: mpsc::UnboundedReceiver<DataEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Transport side of a data connection
#[derive(Debug)]
pub struct DataLink {
    pub events: mpsc::UnboundedSender<DataEvent>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl DataConnection {
    /// New connection pair
    pub fn channel(id: impl Into<String>) -> (Self, DataLink) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                events: events_rx,
                outbound: outbound_tx,
            },
            DataLink {
                events: events_tx,
                outbound: outbound_rx,
            },
        )
    }

    /// Identifier of the remote end
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send a JSON value; false when the transport side is gone
    pub fn send(&self, value: Value) -> bool {
        self.outbound.send(Outbound::Send(value)).is_ok()
    }

    /// Ask the transport to close the connection
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Next event; `None` once the transport dropped its side
    pub async fn recv(&mut self) -> Option<DataEvent> {
        self.events.recv().await
    }
}

/// Call offered by a listener
#[derive(Debug)]
pub struct IncomingCall {
    peer: String,
    answer: oneshot::Sender<()>,
    stream: oneshot::Receiver<InboundStream>,
}

/// Transport side of a call
#[derive(Debug)]
pub struct CallLink {
    /// Resolves when the session answers
    pub answered: oneshot::Receiver<()>,
    /// Delivers the inbound stream once media flows
    pub stream: oneshot::Sender<InboundStream>,
}

/// Answered call, waiting for its stream
#[derive(Debug)]
pub struct AnsweredCall {
    peer: String,
    stream: oneshot::Receiver<InboundStream>,
}

impl IncomingCall {
    /// New call pair
    pub fn channel(peer: impl Into<String>) -> (Self, CallLink) {
        let (answer_tx, answer_rx) = oneshot::channel();
        let (stream_tx, stream_rx) = oneshot::channel();
        (
            Self {
                peer: peer.into(),
                answer: answer_tx,
                stream: stream_rx,
            },
            CallLink {
                answered: answer_rx,
                stream: stream_tx,
            },
        )
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Answer receive-only; nothing is sent back to the caller
    pub fn answer(self) -> AnsweredCall {
        let _ = self.answer.send(());
        AnsweredCall {
            peer: self.peer,
            stream: self.stream,
        }
    }
}

impl AnsweredCall {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Wait for the inbound stream
    pub async fn stream(self) -> Result<InboundStream, SessionError> {
        self.stream.await.map_err(|_| SessionError::CallDropped)
    }
}

/// Requests the session makes of the transport
pub trait PeerControl: Send {
    /// Re-register under `peer_id`; the transport answers with
    /// [`PeerEvent::Open`] on success
    fn reconnect(&mut self, peer_id: &str) -> anyhow::Result<()>;
}

/// `{name, payload}` message on the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub name: String,
    pub payload: Value,
}

impl PeerMessage {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Parse an inbound value; both fields are required
    pub fn parse(value: &Value) -> Result<Self, SessionError> {
        let object = value
            .as_object()
            .ok_or_else(|| SessionError::MalformedMessage(value.to_string()))?;
        match (object.get("name"), object.get("payload")) {
            (Some(Value::String(name)), Some(payload)) => Ok(Self::new(name.clone(), payload.clone())),
            _ => Err(SessionError::MalformedMessage(value.to_string())),
        }
    }

    /// Far-end capture rate from a `samplingRate` payload
    ///
    /// Accepts a bare number or an object carrying `sinkSamplingRate` or
    /// `sampleRate`.
    pub fn sampling_rate(&self) -> Option<u32> {
        let value = match &self.payload {
            Value::Object(fields) => fields
                .get("sinkSamplingRate")
                .or_else(|| fields.get("sampleRate"))?,
            other => other,
        };
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as u64))
            .filter(|&rate| rate > 0)
            .and_then(|rate| u32::try_from(rate).ok())
    }
}

/// Handshake state published by [`Speaker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Open,
    AwaitingConnection,
    Connected,
    Ready,
    Closed,
    Disconnected,
    Error,
}
