//! Speakercal - acoustic calibration with MLS excitation
//!
//! This library re-exports the measurement pipeline from `speakercal-core`
//! and the WebSocket peer transport from `speakercal-server`.

pub use speakercal_core::{analysis, audio, calibration, config, peer};

pub use speakercal_core::{
    CalibrationConfig, CalibrationError, CalibrationPhase, Calibrator, ExcitationSignal,
    ImpulseResponse, ImpulseResponseCalibration, ImpulseResponseReport, MlsHandle, MlsModule,
    SampleRates, SessionError, SimulatedRoom, Speaker, SpeakerOptions, VolumeCalibration,
    VolumeReport,
};
pub use speakercal_core::{DEFAULT_MLS_ORDER, DEFAULT_SAMPLE_RATE, VERSION};

pub use speakercal_server as server;
