//! Volume calibration
//!
//! Runs the same excitation rounds as the impulse response task, then asks
//! the analysis service for a sound level figure of the last captured round.

use std::path::PathBuf;

use tokio::sync::mpsc;

use super::export::SessionExport;
use super::{measure, CalibrationError, CalibrationPhase, Calibrator, PhaseObserver, SampleRates};
use crate::analysis::AnalysisClient;
use crate::audio::device::{InboundStream, PlaybackDevice};
use crate::audio::module::{ExcitationError, MlsModule};
use crate::audio::recorder::{RecordedRound, Recorder};
use crate::config::CalibrationConfig;

/// Result of a volume session
#[derive(Debug, Clone)]
pub struct VolumeReport {
    /// Figure returned by the analysis service, as it was returned
    pub level: serde_json::Value,
    pub last_recording: RecordedRound,
    pub rounds: usize,
    pub sample_rates: SampleRates,
    pub export_dir: Option<PathBuf>,
}

/// Sound level calibration through the analysis service
pub struct VolumeCalibration {
    config: CalibrationConfig,
    playback: Box<dyn PlaybackDevice>,
    module: Option<MlsModule>,
    analysis: AnalysisClient,
    phases: PhaseObserver,
}

impl VolumeCalibration {
    /// Calibration playing through `playback`
    ///
    /// Needs `config.analysis_url`; use [`VolumeCalibration::with_client`]
    /// to pass a client directly.
    pub fn new(
        config: CalibrationConfig,
        playback: Box<dyn PlaybackDevice>,
    ) -> Result<Self, CalibrationError> {
        let url = config
            .analysis_url
            .clone()
            .ok_or(CalibrationError::AnalysisNotConfigured)?;
        let client = AnalysisClient::new(url)?;
        Self::with_client(config, playback, client)
    }

    /// Calibration analysed by `client`
    pub fn with_client(
        config: CalibrationConfig,
        playback: Box<dyn PlaybackDevice>,
        client: AnalysisClient,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        Ok(Self {
            config,
            playback,
            module: None,
            analysis: client,
            phases: PhaseObserver::default(),
        })
    }

    pub fn with_module(mut self, module: MlsModule) -> Self {
        self.module = Some(module);
        self
    }

    pub fn with_phase_observer(mut self, tx: mpsc::UnboundedSender<CalibrationPhase>) -> Self {
        self.phases = PhaseObserver::new(Some(tx));
        self
    }
}

impl Calibrator for VolumeCalibration {
    type Output = VolumeReport;

    fn playback_sample_rate(&self) -> u32 {
        self.playback.sample_rate()
    }

    async fn calibrate(
        self,
        stream: InboundStream,
        rates: SampleRates,
    ) -> Result<VolumeReport, CalibrationError> {
        let Self {
            config,
            playback,
            module,
            analysis,
            phases,
        } = self;

        phases.emit(CalibrationPhase::Init);
        tracing::info!(stream = stream.id(), sink_rate = rates.sink, "Volume calibration started");

        let module = match module {
            Some(module) => Ok(module),
            None => MlsModule::shared().await,
        };
        let mut handle = match module {
            Ok(module) => module.create().await,
            Err(e) => Err(e),
        }
        .inspect_err(|_| phases.emit(CalibrationPhase::Failed))?;
        let mut recorder = Recorder::new(playback, config.playback_settle());

        let result = async {
            let measurement =
                measure(&mut handle, &mut recorder, &stream, &config, &phases).await?;

            phases.emit(CalibrationPhase::Finalizing);
            let last = measurement
                .recordings
                .last()
                .cloned()
                .ok_or(ExcitationError::EmptyRecording)?;
            let level = analysis.volume(&last.samples, last.sample_rate).await?;
            tracing::info!(%level, "Volume computed");

            let export_dir = if config.download {
                let export = SessionExport {
                    excitation: measurement.excitation,
                    playback_sample_rate: recorder.playback_sample_rate(),
                    recordings: measurement.recordings.clone(),
                    impulse_response: None,
                    inverse_impulse_response: None,
                };
                Some(export.write_async(config.export_dir()).await?)
            } else {
                None
            };

            Ok::<_, CalibrationError>(VolumeReport {
                level,
                last_recording: last,
                rounds: measurement.recordings.len(),
                sample_rates: rates,
                export_dir,
            })
        }
        .await;

        handle.release();

        match &result {
            Ok(_) => phases.emit(CalibrationPhase::Done),
            Err(e) => {
                tracing::error!(kind = e.kind(), error = %e, "Volume calibration failed");
                phases.emit(CalibrationPhase::Failed);
            }
        }
        result
    }
}
