//! Speakercal Core - Acoustic measurement pipeline
//!
//! Measures a loudspeaker/microphone path by playing a Maximum Length Sequence
//! (MLS) excitation, recording the far-end response over a peer connection and
//! extracting an impulse response from the recorded rounds.
//!
//! Components, leaves first:
//! - [`audio::module`]: MLS generation and impulse response extraction behind
//!   an explicitly released handle
//! - [`audio::recorder`]: capture/playback of one measurement round
//! - [`calibration`]: round orchestration and calibration tasks
//! - [`peer::session`]: single-connection handshake and deadline enforcement

pub mod analysis;
pub mod audio;
pub mod calibration;
pub mod config;
pub mod peer;

pub use analysis::{AnalysisClient, AnalysisTask};
pub use audio::module::{ImpulseResponse, MlsHandle, MlsModule};
pub use audio::recorder::{Recorder, RecordingSet};
pub use audio::signal::ExcitationSignal;
pub use audio::simulated::SimulatedRoom;
pub use calibration::impulse::{ImpulseResponseCalibration, ImpulseResponseReport};
pub use calibration::volume::{VolumeCalibration, VolumeReport};
pub use calibration::{CalibrationError, CalibrationPhase, Calibrator, SampleRates};
pub use config::CalibrationConfig;
pub use peer::session::{SessionError, Speaker, SpeakerOptions};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default playback sample rate when no device reports one
pub const DEFAULT_SAMPLE_RATE: u32 = 96000;

/// Default MLS order (2^ORDER - 1 samples)
pub const DEFAULT_MLS_ORDER: u32 = 18;

/// Smallest MLS order the taps table supports
pub const MIN_MLS_ORDER: u32 = 3;

/// Largest MLS order the taps table supports
pub const MAX_MLS_ORDER: u32 = 18;
