//! Impulse response calibration

use std::path::PathBuf;

use tokio::sync::mpsc;

use super::export::SessionExport;
use super::{
    measure, CalibrationError, CalibrationPhase, Calibrator, Measurement, PhaseObserver,
    SampleRates,
};
use crate::analysis::AnalysisClient;
use crate::audio::device::{InboundStream, PlaybackDevice};
use crate::audio::module::{ImpulseResponse, MlsModule};
use crate::audio::recorder::{RecordedRound, Recorder, RecordingSet};
use crate::audio::signal::ExcitationSignal;
use crate::config::CalibrationConfig;

/// Result of an impulse response session
#[derive(Debug, Clone)]
pub struct ImpulseResponseReport {
    pub impulse_response: ImpulseResponse,
    /// Inverse filter from the analysis service, when one is configured
    pub inverse_impulse_response: Option<Vec<f64>>,
    pub excitation: ExcitationSignal,
    pub recordings: RecordingSet,
    pub sample_rates: SampleRates,
    /// Directory the session was exported to (`download = true`)
    pub export_dir: Option<PathBuf>,
}

impl ImpulseResponseReport {
    /// Most recent captured round
    pub fn last_recording(&self) -> Option<&RecordedRound> {
        self.recordings.last()
    }
}

/// Measures the acoustic impulse response with an MLS excitation
pub struct ImpulseResponseCalibration {
    config: CalibrationConfig,
    playback: Box<dyn PlaybackDevice>,
    module: Option<MlsModule>,
    analysis: Option<AnalysisClient>,
    phases: PhaseObserver,
}

impl ImpulseResponseCalibration {
    /// Calibration playing through `playback`
    ///
    /// Fails if `config` does not validate. An analysis client is created
    /// when `config.analysis_url` is set.
    pub fn new(
        config: CalibrationConfig,
        playback: Box<dyn PlaybackDevice>,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        let analysis = config
            .analysis_url
            .as_deref()
            .map(AnalysisClient::new)
            .transpose()?;

        Ok(Self {
            config,
            playback,
            module: None,
            analysis,
            phases: PhaseObserver::default(),
        })
    }

    /// Use `module` instead of the process-wide one
    pub fn with_module(mut self, module: MlsModule) -> Self {
        self.module = Some(module);
        self
    }

    /// Post-process through `client`
    pub fn with_analysis(mut self, client: AnalysisClient) -> Self {
        self.analysis = Some(client);
        self
    }

    /// Report every phase transition on `tx`
    pub fn with_phase_observer(mut self, tx: mpsc::UnboundedSender<CalibrationPhase>) -> Self {
        self.phases = PhaseObserver::new(Some(tx));
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }
}

impl Calibrator for ImpulseResponseCalibration {
    type Output = ImpulseResponseReport;

    fn playback_sample_rate(&self) -> u32 {
        self.playback.sample_rate()
    }

    async fn calibrate(
        self,
        stream: InboundStream,
        rates: SampleRates,
    ) -> Result<ImpulseResponseReport, CalibrationError> {
        let Self {
            config,
            playback,
            module,
            analysis,
            phases,
        } = self;

        phases.emit(CalibrationPhase::Init);
        tracing::info!(
            stream = stream.id(),
            source_rate = rates.source,
            sink_rate = rates.sink,
            "Impulse response calibration started"
        );

        let module = match module {
            Some(module) => module,
            None => match MlsModule::shared().await {
                Ok(module) => module,
                Err(e) => {
                    phases.emit(CalibrationPhase::Failed);
                    return Err(e.into());
                }
            },
        };
        let mut handle = match module.create().await {
            Ok(handle) => handle,
            Err(e) => {
                phases.emit(CalibrationPhase::Failed);
                return Err(e.into());
            }
        };
        let mut recorder = Recorder::new(playback, config.playback_settle());

        let result = async {
            let Measurement {
                excitation,
                recordings,
            } = measure(&mut handle, &mut recorder, &stream, &config, &phases).await?;

            phases.emit(CalibrationPhase::Finalizing);
            handle.set_recorded_signal(&recordings)?;
            let impulse_response = handle.compute_impulse_response()?;
            tracing::info!(
                samples = impulse_response.samples.len(),
                sample_rate = impulse_response.sample_rate,
                "Impulse response computed"
            );

            let inverse_impulse_response = match &analysis {
                Some(client) => Some(
                    client
                        .inverse_impulse_response(&impulse_response.samples)
                        .await?,
                ),
                None => None,
            };

            let export_dir = if config.download {
                let export = SessionExport {
                    excitation: excitation.clone(),
                    playback_sample_rate: recorder.playback_sample_rate(),
                    recordings: recordings.clone(),
                    impulse_response: Some(impulse_response.clone()),
                    inverse_impulse_response: inverse_impulse_response.clone(),
                };
                Some(export.write_async(config.export_dir()).await?)
            } else {
                None
            };

            Ok::<_, CalibrationError>(ImpulseResponseReport {
                impulse_response,
                inverse_impulse_response,
                excitation,
                recordings,
                sample_rates: rates,
                export_dir,
            })
        }
        .await;

        handle.release();

        match &result {
            Ok(_) => phases.emit(CalibrationPhase::Done),
            Err(e) => {
                tracing::error!(kind = e.kind(), error = %e, "Impulse response calibration failed");
                phases.emit(CalibrationPhase::Failed);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::SimulatedRoom;

    fn config(order: u32, rounds: u32) -> CalibrationConfig {
        CalibrationConfig {
            num_mls_per_capture: rounds,
            mls_order: order,
            playback_settle_ms: Some(10),
            inter_round_settle_ms: 5,
            ..Default::default()
        }
    }

    fn rates() -> SampleRates {
        SampleRates {
            source: 8000,
            sink: 8000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_room_response() {
        let module = MlsModule::load().await.unwrap();
        let room = SimulatedRoom::new(vec![0.0, 0.0, 0.9, 0.3, -0.2], 8000);
        let calibration = ImpulseResponseCalibration::new(config(7, 2), room.speaker())
            .unwrap()
            .with_module(module.clone());

        let report = calibration
            .calibrate(room.input_stream("room"), rates())
            .await
            .unwrap();

        let ir = &report.impulse_response.samples;
        assert_eq!(ir.len(), 128);
        assert!((ir[2] - 0.9).abs() < 1e-5);
        assert!((ir[3] - 0.3).abs() < 1e-5);
        assert!((ir[4] + 0.2).abs() < 1e-5);
        assert!(ir[5..].iter().all(|v| v.abs() < 1e-5));
        assert_eq!(report.recordings.len(), 2);
        assert_eq!(report.last_recording().map(|r| r.index), Some(1));
        assert_eq!(module.live_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phases_in_order() {
        let module = MlsModule::load().await.unwrap();
        let room = SimulatedRoom::new(vec![1.0], 8000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let calibration = ImpulseResponseCalibration::new(config(4, 1), room.speaker())
            .unwrap()
            .with_module(module)
            .with_phase_observer(tx);

        calibration
            .calibrate(room.input_stream("room"), rates())
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(phase) = rx.try_recv() {
            phases.push(phase);
        }
        assert_eq!(
            phases,
            vec![
                CalibrationPhase::Init,
                CalibrationPhase::RoundRecording { round: 0 },
                CalibrationPhase::RoundPlaying { round: 0 },
                CalibrationPhase::RoundSettling { round: 0 },
                CalibrationPhase::Finalizing,
                CalibrationPhase::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_room_fails_before_finalizing() {
        let module = MlsModule::load().await.unwrap();
        let room = SimulatedRoom::muted(8000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let calibration = ImpulseResponseCalibration::new(config(4, 3), room.speaker())
            .unwrap()
            .with_module(module.clone())
            .with_phase_observer(tx);

        let err = calibration
            .calibrate(room.input_stream("room"), rates())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "NoDataCapturedError");
        assert_eq!(module.live_handles(), 0);

        let mut phases = Vec::new();
        while let Ok(phase) = rx.try_recv() {
            phases.push(phase);
        }
        assert!(!phases.contains(&CalibrationPhase::Finalizing));
        assert_eq!(phases.last(), Some(&CalibrationPhase::Failed));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let room = SimulatedRoom::new(vec![1.0], 8000);
        let result = ImpulseResponseCalibration::new(config(2, 1), room.speaker());
        assert!(matches!(result, Err(CalibrationError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_exports_session() {
        let dir = tempfile::tempdir().unwrap();
        let module = MlsModule::load().await.unwrap();
        let room = SimulatedRoom::new(vec![1.0], 8000);
        let mut cfg = config(4, 2);
        cfg.download = true;
        cfg.download_dir = Some(dir.path().to_path_buf());
        let calibration = ImpulseResponseCalibration::new(cfg, room.speaker())
            .unwrap()
            .with_module(module);

        let report = calibration
            .calibrate(room.input_stream("room"), rates())
            .await
            .unwrap();

        let export_dir = report.export_dir.unwrap();
        assert!(export_dir.join("excitation.wav").exists());
        assert!(export_dir.join("round-01.wav").exists());
        assert!(export_dir.join("impulse-response.wav").exists());
    }
}
