//! Capture and playback device seams
//!
//! The recorder never talks to hardware directly. Capture comes from an
//! [`InboundStream`] (the far end's microphone, delivered by the peer
//! transport) and playback goes to a [`PlaybackDevice`].

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::recorder::RecorderError;

/// Event delivered by a capture device while recording
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A chunk of encoded audio
    Data(Vec<u8>),
    /// Capture finalised; no more chunks follow
    Stopped,
}

/// Source of captured audio chunks
///
/// After [`CaptureDevice::stop`] the device must deliver any pending chunks
/// followed by [`CaptureEvent::Stopped`] (or drop the sink).
pub trait CaptureDevice: Send {
    /// Begin delivering chunks to `sink`
    fn start(&mut self, sink: mpsc::UnboundedSender<CaptureEvent>) -> Result<(), RecorderError>;

    /// Stop capturing and flush
    fn stop(&mut self) -> Result<(), RecorderError>;
}

/// Encoding of the chunks an inbound stream produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamEncoding {
    /// Chunks concatenate to a WAV file
    Wav,
    /// Raw little-endian f32 mono samples
    PcmF32le,
}

/// Live audio stream from the far end
///
/// Cheap to clone; clones share the same capture device. The id tells
/// streams apart so a recorder can refuse to rebind.
#[derive(Clone)]
pub struct InboundStream {
    id: String,
    sample_rate: u32,
    encoding: StreamEncoding,
    device: Arc<Mutex<Box<dyn CaptureDevice>>>,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl InboundStream {
    /// Wrap a capture device
    pub fn new(
        id: impl Into<String>,
        sample_rate: u32,
        encoding: StreamEncoding,
        device: Box<dyn CaptureDevice>,
    ) -> Self {
        Self {
            id: id.into(),
            sample_rate,
            encoding,
            device: Arc::new(Mutex::new(device)),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared capture sample rate (used for raw PCM)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Chunk encoding
    pub fn encoding(&self) -> StreamEncoding {
        self.encoding
    }

    pub(crate) fn start(
        &self,
        sink: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<(), RecorderError> {
        self.device
            .lock()
            .map_err(|_| RecorderError::Device("capture device poisoned".into()))?
            .start(sink)
    }

    pub(crate) fn stop(&self) -> Result<(), RecorderError> {
        self.device
            .lock()
            .map_err(|_| RecorderError::Device("capture device poisoned".into()))?
            .stop()
    }
}

/// Single-channel buffer handed to a playback device
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Local audio output
pub trait PlaybackDevice: Send {
    /// Output sample rate
    fn sample_rate(&self) -> u32;

    /// Start playing `buffer` once
    fn start(&mut self, buffer: PlaybackBuffer) -> Result<(), RecorderError>;

    /// Stop playback and release output resources
    fn stop(&mut self);
}
