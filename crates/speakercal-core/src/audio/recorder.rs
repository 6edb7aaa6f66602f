//! Round recorder
//!
//! Binds once to an inbound stream, captures one round at a time and plays
//! the excitation on the local output.
//!
//! A round is: [`Recorder::start_recording`], [`Recorder::play_excitation`]
//! (suspends until playback has settled), then [`Recorder::stop_recording`].
//! Capture is stopped strictly after playback completes so the tail of the
//! acoustic response lands in the recording.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use super::device::{CaptureEvent, InboundStream, PlaybackBuffer, PlaybackDevice};
use super::signal::ExcitationSignal;
use super::wav;

/// Extra time after the nominal signal duration when playback settle is derived
const DERIVED_SETTLE_TAIL: Duration = Duration::from_millis(250);

/// Errors raised while capturing or playing
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("No audio data captured")]
    NoDataCaptured,

    #[error("No round recorded yet")]
    NoRecordingYet,

    #[error("Recorder is bound to stream {bound}, refusing to rebind to {requested}")]
    StreamRebound { bound: String, requested: String },

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Recording was not started")]
    NotRecording,

    #[error("Failed to decode captured audio: {0}")]
    Decode(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

impl RecorderError {
    /// Taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoDataCaptured => "NoDataCapturedError",
            Self::NoRecordingYet => "NoRecordingYetError",
            Self::StreamRebound { .. } => "StreamReboundError",
            Self::AlreadyRecording => "AlreadyRecordingError",
            Self::NotRecording => "NotRecordingError",
            Self::Decode(_) => "DecodeError",
            Self::Device(_) => "DeviceError",
        }
    }
}

/// One captured waveform
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRound {
    /// Zero-based round index
    pub index: usize,
    /// Capture sample rate
    pub sample_rate: u32,
    /// Mono samples
    pub samples: Vec<f32>,
    /// When capture finalised
    pub captured_at: DateTime<Utc>,
}

/// Ordered, append-only list of rounds for one session
#[derive(Debug, Clone, Default)]
pub struct RecordingSet {
    rounds: Vec<RecordedRound>,
}

impl RecordingSet {
    /// Append a round
    pub fn push(&mut self, round: RecordedRound) {
        self.rounds.push(round);
    }

    /// Number of rounds
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    /// True when no round was recorded
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Most recent round
    pub fn last(&self) -> Option<&RecordedRound> {
        self.rounds.last()
    }

    /// Rounds in capture order
    pub fn iter(&self) -> impl Iterator<Item = &RecordedRound> {
        self.rounds.iter()
    }

    /// Drop all rounds (new session)
    pub fn clear(&mut self) {
        self.rounds.clear();
    }
}

/// How long [`Recorder::play_excitation`] waits after starting playback
///
/// `Fixed` is a wall-clock stand-in for playback tracking: a signal longer
/// than the fixed delay is cut short. `Derived` waits the signal duration at
/// the output rate plus a short tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSettle {
    Fixed(Duration),
    Derived,
}

impl PlaybackSettle {
    /// Wait for a signal of `samples` length at `sample_rate`
    pub fn duration(&self, samples: usize, sample_rate: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Derived => {
                let secs = samples as f64 / sample_rate.max(1) as f64;
                Duration::from_secs_f64(secs) + DERIVED_SETTLE_TAIL
            }
        }
    }
}

/// Stops the output when dropped, also on cancellation
struct PlaybackGuard<'a>(&'a mut dyn PlaybackDevice);

impl Drop for PlaybackGuard<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Capture/playback recorder for one session
pub struct Recorder {
    playback: Box<dyn PlaybackDevice>,
    settle: PlaybackSettle,
    bound: Option<InboundStream>,
    capture: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    recordings: RecordingSet,
}

impl Recorder {
    /// Create a recorder playing through `playback`
    pub fn new(playback: Box<dyn PlaybackDevice>, settle: PlaybackSettle) -> Self {
        Self {
            playback,
            settle,
            bound: None,
            capture: None,
            recordings: RecordingSet::default(),
        }
    }

    /// Output sample rate
    pub fn playback_sample_rate(&self) -> u32 {
        self.playback.sample_rate()
    }

    /// Whether a round is being captured
    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }

    /// Bind to `stream` (first call only) and start capturing a new round
    pub fn start_recording(&mut self, stream: &InboundStream) -> Result<(), RecorderError> {
        if let Some(bound) = &self.bound {
            if bound.id() != stream.id() {
                return Err(RecorderError::StreamRebound {
                    bound: bound.id().to_string(),
                    requested: stream.id().to_string(),
                });
            }
        }
        if self.capture.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }

        let bound = self.bound.get_or_insert_with(|| {
            tracing::debug!(stream = stream.id(), "Recorder bound to inbound stream");
            stream.clone()
        });

        let (tx, rx) = mpsc::unbounded_channel();
        bound.start(tx)?;
        self.capture = Some(rx);

        tracing::debug!(round = self.recordings.len(), "Recording started");
        Ok(())
    }

    /// Stop capture, wait for the final chunk and append the decoded round
    pub async fn stop_recording(&mut self) -> Result<&RecordedRound, RecorderError> {
        let mut rx = self.capture.take().ok_or(RecorderError::NotRecording)?;
        let stream = self.bound.clone().ok_or(RecorderError::NotRecording)?;

        stream.stop()?;

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                CaptureEvent::Data(chunk) if !chunk.is_empty() => chunks.push(chunk),
                CaptureEvent::Data(_) => {}
                CaptureEvent::Stopped => break,
            }
        }

        if chunks.is_empty() {
            tracing::warn!(round = self.recordings.len(), "No data captured");
            return Err(RecorderError::NoDataCaptured);
        }

        let blob = chunks.concat();
        let encoding = stream.encoding();
        let declared_rate = stream.sample_rate();
        let (samples, sample_rate) =
            tokio::task::spawn_blocking(move || wav::decode(&blob, encoding, declared_rate))
                .await
                .map_err(|e| RecorderError::Decode(e.to_string()))??;

        let index = self.recordings.len();
        tracing::info!(
            round = index,
            chunks = chunks.len(),
            samples = samples.len(),
            sample_rate,
            "Round captured"
        );

        self.recordings.push(RecordedRound {
            index,
            sample_rate,
            samples,
            captured_at: Utc::now(),
        });
        self.recordings.last().ok_or(RecorderError::NoRecordingYet)
    }

    /// Play the excitation verbatim and wait for the playback settle time
    ///
    /// Builds a single-channel buffer of exactly `signal.len()` samples with
    /// no resampling or normalisation. Output resources are released when
    /// this returns or is cancelled.
    pub async fn play_excitation(&mut self, signal: &ExcitationSignal) -> Result<(), RecorderError> {
        let sample_rate = self.playback.sample_rate();
        let buffer = PlaybackBuffer {
            sample_rate,
            samples: signal.samples().to_vec(),
        };
        let wait = self.settle.duration(signal.len(), sample_rate);

        if let PlaybackSettle::Fixed(fixed) = self.settle {
            let nominal = signal.duration(sample_rate);
            if nominal > fixed {
                tracing::warn!(
                    nominal_ms = nominal.as_millis() as u64,
                    settle_ms = fixed.as_millis() as u64,
                    "Fixed playback settle is shorter than the excitation"
                );
            }
        }

        self.playback.start(buffer)?;
        let _guard = PlaybackGuard(self.playback.as_mut());

        tracing::debug!(
            samples = signal.len(),
            sample_rate,
            wait_ms = wait.as_millis() as u64,
            "Playing excitation"
        );
        tokio::time::sleep(wait).await;

        Ok(())
    }

    /// Most recent round
    pub fn get_last_recorded_signal(&self) -> Result<&RecordedRound, RecorderError> {
        self.recordings.last().ok_or(RecorderError::NoRecordingYet)
    }

    /// All rounds recorded so far
    pub fn recordings(&self) -> &RecordingSet {
        &self.recordings
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.capture.take().is_some() {
            if let Some(stream) = &self.bound {
                if let Err(e) = stream.stop() {
                    tracing::warn!(error = %e, "Failed to stop capture on drop");
                }
            }
        }
    }
}
