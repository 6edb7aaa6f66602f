//! Calibration orchestration
//!
//! A calibration task drives one session over a live inbound stream:
//!
//! 1. `Init`: acquire an MLS handle and generate the excitation
//! 2. per round: start capture, play the excitation, stop capture after
//!    playback completes, then settle while reverberation decays
//! 3. `Finalizing`: task-specific analysis of the recorded rounds
//! 4. `Done` or `Failed`
//!
//! Exactly `num_captures * num_mls_per_capture` rounds run; a failed round is
//! never retried. The handle is released on every terminal path.

pub mod export;
pub mod impulse;
pub mod volume;

use std::future::Future;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::analysis::AnalysisError;
use crate::audio::device::InboundStream;
use crate::audio::module::{ExcitationError, MlsHandle};
use crate::audio::recorder::{Recorder, RecorderError, RecordingSet};
use crate::audio::signal::ExcitationSignal;
use crate::config::{CalibrationConfig, ConfigError};
use export::ExportError;

/// Errors that end a calibration session
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error(transparent)]
    Excitation(#[from] ExcitationError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No analysis service configured")]
    AnalysisNotConfigured,
}

impl CalibrationError {
    /// Taxonomy name of the originating error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Excitation(e) => e.kind(),
            Self::Recorder(e) => e.kind(),
            Self::Analysis(e) => e.kind(),
            Self::Export(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::AnalysisNotConfigured => "AnalysisNotConfiguredError",
        }
    }
}

/// Orchestrator phase, reported to an optional observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum CalibrationPhase {
    Init,
    RoundRecording { round: usize },
    RoundPlaying { round: usize },
    RoundSettling { round: usize },
    Finalizing,
    Done,
    Failed,
}

/// Playback and far-end capture rates agreed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRates {
    /// Local playback rate
    pub source: u32,
    /// Far-end capture rate announced over the data channel
    pub sink: u32,
}

/// A calibration task runnable by [`crate::peer::session::Speaker`]
pub trait Calibrator: Send + 'static {
    type Output: Send + 'static;

    /// Local playback rate this task plays at
    fn playback_sample_rate(&self) -> u32;

    /// Run one session over `stream`
    fn calibrate(
        self,
        stream: InboundStream,
        rates: SampleRates,
    ) -> impl Future<Output = Result<Self::Output, CalibrationError>> + Send;
}

/// Optional sink for phase transitions
#[derive(Debug, Clone, Default)]
pub(crate) struct PhaseObserver(Option<mpsc::UnboundedSender<CalibrationPhase>>);

impl PhaseObserver {
    pub(crate) fn new(tx: Option<mpsc::UnboundedSender<CalibrationPhase>>) -> Self {
        Self(tx)
    }

    pub(crate) fn emit(&self, phase: CalibrationPhase) {
        tracing::debug!(?phase, "Calibration phase");
        if let Some(tx) = &self.0 {
            let _ = tx.send(phase);
        }
    }
}

/// Excitation and rounds captured by [`measure`]
#[derive(Debug, Clone)]
pub struct Measurement {
    pub excitation: ExcitationSignal,
    pub recordings: RecordingSet,
}

/// Generate the excitation and run every configured round
pub(crate) async fn measure(
    handle: &mut MlsHandle,
    recorder: &mut Recorder,
    stream: &InboundStream,
    config: &CalibrationConfig,
    phases: &PhaseObserver,
) -> Result<Measurement, CalibrationError> {
    let excitation = handle.generate(config.mls_order)?;
    let total = config.num_rounds() as usize;

    tracing::info!(
        order = config.mls_order,
        samples = excitation.len(),
        rounds = total,
        "Starting measurement"
    );

    for round in 0..total {
        phases.emit(CalibrationPhase::RoundRecording { round });
        recorder.start_recording(stream)?;

        phases.emit(CalibrationPhase::RoundPlaying { round });
        recorder.play_excitation(&excitation).await?;
        recorder.stop_recording().await?;

        phases.emit(CalibrationPhase::RoundSettling { round });
        tokio::time::sleep(config.inter_round_settle()).await;
        tracing::info!(round, total, "Calibration round complete");
    }

    Ok(Measurement {
        excitation,
        recordings: recorder.recordings().clone(),
    })
}
