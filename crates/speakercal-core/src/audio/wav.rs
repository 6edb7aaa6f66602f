//! WAV encode/decode helpers
//!
//! Captured blobs are decoded to mono f32 (first channel). Exports and the
//! simulated capture path write 32-bit float mono WAV.

use std::io::Cursor;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::device::StreamEncoding;
use super::recorder::RecorderError;

fn mono_float_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Encode mono samples as an in-memory 32-bit float WAV file
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, mono_float_spec(sample_rate))?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Write mono samples to a 32-bit float WAV file
pub fn write_file(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), hound::Error> {
    let mut writer = WavWriter::create(path, mono_float_spec(sample_rate))?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()
}

/// Read the first channel of a WAV file
pub fn read_file(path: &Path) -> Result<(Vec<f32>, u32), RecorderError> {
    let reader = WavReader::open(path).map_err(|e| RecorderError::Decode(e.to_string()))?;
    read_first_channel(reader)
}

/// Decode an assembled capture blob into samples and its sample rate
///
/// WAV blobs carry their own rate; raw PCM uses `declared_rate`.
pub fn decode(
    blob: &[u8],
    encoding: StreamEncoding,
    declared_rate: u32,
) -> Result<(Vec<f32>, u32), RecorderError> {
    match encoding {
        StreamEncoding::Wav => {
            let reader =
                WavReader::new(Cursor::new(blob)).map_err(|e| RecorderError::Decode(e.to_string()))?;
            read_first_channel(reader)
        }
        StreamEncoding::PcmF32le => {
            if blob.len() % 4 != 0 {
                return Err(RecorderError::Decode(format!(
                    "raw f32 blob length {} is not a multiple of 4",
                    blob.len()
                )));
            }
            let samples = blob
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok((samples, declared_rate))
        }
    }
}

fn read_first_channel<R: std::io::Read>(
    mut reader: WavReader<R>,
) -> Result<(Vec<f32>, u32), RecorderError> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| RecorderError::Decode(e.to_string()))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| RecorderError::Decode(e.to_string()))?
        }
    };

    let samples = interleaved.into_iter().step_by(channels).collect();
    Ok((samples, spec.sample_rate))
}
