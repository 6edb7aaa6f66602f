//! Simulated acoustic path
//!
//! Couples a playback device and a capture device through a known impulse
//! response. Whatever is played while capture is running reaches the
//! microphone as the steady-state periodic response (circular convolution of
//! the played buffer), delivered as a WAV blob split over several chunks the
//! way a browser recorder hands them out.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::device::{
    CaptureDevice, CaptureEvent, InboundStream, PlaybackBuffer, PlaybackDevice, StreamEncoding,
};
use super::recorder::RecorderError;
use super::wav;

/// Number of chunks a captured blob is split into
const CHUNKS_PER_CAPTURE: usize = 3;

#[derive(Default)]
struct RoomState {
    impulse_response: Vec<f64>,
    muted: bool,
    sink: Option<mpsc::UnboundedSender<CaptureEvent>>,
    played: Option<Vec<f32>>,
    plays: usize,
    captures: usize,
}

/// Loudspeaker and microphone sharing one simulated room
#[derive(Clone)]
pub struct SimulatedRoom {
    sample_rate: u32,
    state: Arc<Mutex<RoomState>>,
}

impl SimulatedRoom {
    /// Room whose path from speaker to microphone is `impulse_response`
    pub fn new(impulse_response: Vec<f64>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(Mutex::new(RoomState {
                impulse_response,
                ..Default::default()
            })),
        }
    }

    /// Room whose microphone never delivers data
    pub fn muted(sample_rate: u32) -> Self {
        let room = Self::new(Vec::new(), sample_rate);
        if let Ok(mut state) = room.state.lock() {
            state.muted = true;
        }
        room
    }

    /// Sample rate shared by speaker and microphone
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback device feeding the room
    pub fn speaker(&self) -> Box<dyn PlaybackDevice> {
        Box::new(SimulatedSpeaker { room: self.clone() })
    }

    /// Inbound stream capturing the room
    pub fn input_stream(&self, id: impl Into<String>) -> InboundStream {
        InboundStream::new(
            id,
            self.sample_rate,
            StreamEncoding::Wav,
            Box::new(SimulatedMicrophone { room: self.clone() }),
        )
    }

    /// Times playback was started
    pub fn plays(&self) -> usize {
        self.lock().map(|s| s.plays).unwrap_or(0)
    }

    /// Captures that finished with data
    pub fn captures(&self) -> usize {
        self.lock().map(|s| s.captures).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RoomState>, RecorderError> {
        self.state
            .lock()
            .map_err(|_| RecorderError::Device("simulated room poisoned".into()))
    }
}

/// Steady-state response of a periodic excitation through `h`
pub fn circular_convolve(signal: &[f32], h: &[f64]) -> Vec<f32> {
    let p = signal.len();
    if p == 0 {
        return Vec::new();
    }
    (0..p)
        .map(|i| {
            h.iter()
                .enumerate()
                .map(|(k, &hk)| hk * signal[(i + p - k % p) % p] as f64)
                .sum::<f64>() as f32
        })
        .collect()
}

struct SimulatedSpeaker {
    room: SimulatedRoom,
}

impl PlaybackDevice for SimulatedSpeaker {
    fn sample_rate(&self) -> u32 {
        self.room.sample_rate
    }

    fn start(&mut self, buffer: PlaybackBuffer) -> Result<(), RecorderError> {
        let mut state = self.room.lock()?;
        state.plays += 1;
        if state.sink.is_some() {
            state.played = Some(buffer.samples);
        }
        Ok(())
    }

    fn stop(&mut self) {}
}

struct SimulatedMicrophone {
    room: SimulatedRoom,
}

impl CaptureDevice for SimulatedMicrophone {
    fn start(&mut self, sink: mpsc::UnboundedSender<CaptureEvent>) -> Result<(), RecorderError> {
        let mut state = self.room.lock()?;
        state.played = None;
        state.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        let (sink, played, h, muted) = {
            let mut state = self.room.lock()?;
            let sink = state.sink.take();
            let played = state.played.take();
            (sink, played, state.impulse_response.clone(), state.muted)
        };
        let Some(sink) = sink else {
            return Ok(());
        };

        if !muted {
            let response = circular_convolve(played.as_deref().unwrap_or(&[]), &h);
            let blob = wav::encode(&response, self.room.sample_rate)
                .map_err(|e| RecorderError::Device(e.to_string()))?;
            let chunk_len = blob.len().div_ceil(CHUNKS_PER_CAPTURE).max(1);
            for chunk in blob.chunks(chunk_len) {
                let _ = sink.send(CaptureEvent::Data(chunk.to_vec()));
            }
            self.room.lock()?.captures += 1;
        }

        let _ = sink.send(CaptureEvent::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_hears_played_buffer() {
        let room = SimulatedRoom::new(vec![0.5, 0.25], 8000);
        let stream = room.input_stream("room");
        let mut speaker = room.speaker();

        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.start(tx).unwrap();
        speaker
            .start(PlaybackBuffer {
                sample_rate: 8000,
                samples: vec![1.0, -1.0, 1.0, 1.0],
            })
            .unwrap();
        speaker.stop();
        stream.stop().unwrap();

        let mut blob = Vec::new();
        let mut chunks = 0;
        while let Some(event) = rx.recv().await {
            match event {
                CaptureEvent::Data(chunk) => {
                    chunks += 1;
                    blob.extend(chunk);
                }
                CaptureEvent::Stopped => break,
            }
        }

        let (samples, rate) = wav::decode(&blob, StreamEncoding::Wav, 0).unwrap();
        assert_eq!(rate, 8000);
        assert_eq!(chunks, CHUNKS_PER_CAPTURE);
        assert_eq!(samples, vec![0.75, -0.25, 0.25, 0.75]);
        assert_eq!(room.captures(), 1);
        assert_eq!(room.plays(), 1);
    }

    #[tokio::test]
    async fn test_muted_room_only_stops() {
        let room = SimulatedRoom::muted(8000);
        let stream = room.input_stream("room");

        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.start(tx).unwrap();
        stream.stop().unwrap();

        assert_eq!(rx.recv().await, Some(CaptureEvent::Stopped));
        assert_eq!(room.captures(), 0);
    }

    #[test]
    fn test_circular_convolve_wraps() {
        let y = circular_convolve(&[1.0, 0.0, 0.0], &[0.0, 0.0, 1.0]);
        assert_eq!(y, vec![0.0, 0.0, 1.0]);

        let y = circular_convolve(&[0.0, 0.0, 1.0], &[0.0, 1.0]);
        assert_eq!(y, vec![1.0, 0.0, 0.0]);
    }
}
