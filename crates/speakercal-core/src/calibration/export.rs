//! WAV export of a finished session
//!
//! Writes the excitation, every captured round and the derived responses as
//! 32-bit float mono WAV files under a timestamped directory:
//!
//! ```text
//! <export_dir>/20260114-153012.417/
//!     excitation.wav
//!     round-00.wav
//!     round-01.wav
//!     impulse-response.wav
//!     inverse-impulse-response.wav
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::audio::module::ImpulseResponse;
use crate::audio::recorder::RecordingSet;
use crate::audio::signal::ExcitationSignal;
use crate::audio::wav;

/// Errors while writing an export
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("Export task failed: {0}")]
    Join(String),
}

impl ExportError {
    /// Taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "ExportIoError",
            Self::Wav(_) => "ExportWavError",
            Self::Join(_) => "ExportError",
        }
    }
}

/// Everything a session export contains
#[derive(Debug, Clone)]
pub struct SessionExport {
    pub excitation: ExcitationSignal,
    pub playback_sample_rate: u32,
    pub recordings: RecordingSet,
    pub impulse_response: Option<ImpulseResponse>,
    pub inverse_impulse_response: Option<Vec<f64>>,
}

impl SessionExport {
    /// Write all files into a new timestamped directory under `root`
    pub fn write(&self, root: &Path) -> Result<PathBuf, ExportError> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let dir = root.join(stamp);
        std::fs::create_dir_all(&dir)?;

        wav::write_file(
            &dir.join("excitation.wav"),
            self.excitation.samples(),
            self.playback_sample_rate,
        )?;

        for round in self.recordings.iter() {
            wav::write_file(
                &dir.join(format!("round-{:02}.wav", round.index)),
                &round.samples,
                round.sample_rate,
            )?;
        }

        if let Some(ir) = &self.impulse_response {
            let samples: Vec<f32> = ir.samples.iter().map(|&v| v as f32).collect();
            wav::write_file(&dir.join("impulse-response.wav"), &samples, ir.sample_rate)?;

            if let Some(inverse) = &self.inverse_impulse_response {
                let samples: Vec<f32> = inverse.iter().map(|&v| v as f32).collect();
                wav::write_file(
                    &dir.join("inverse-impulse-response.wav"),
                    &samples,
                    ir.sample_rate,
                )?;
            }
        }

        tracing::info!(
            dir = %dir.display(),
            rounds = self.recordings.len(),
            "Session exported"
        );
        Ok(dir)
    }

    /// [`SessionExport::write`] on the blocking pool
    pub async fn write_async(self, root: PathBuf) -> Result<PathBuf, ExportError> {
        tokio::task::spawn_blocking(move || self.write(&root))
            .await
            .map_err(|e| ExportError::Join(e.to_string()))?
    }
}
