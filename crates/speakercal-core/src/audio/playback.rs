//! Local excitation playback via cpal
//!
//! `cpal::Stream` is not `Send`, so each playback owns a short-lived thread
//! that builds the output stream, plays the buffer once and drops the stream
//! when told to stop over a crossbeam channel.
//!
//! Stopping is called from async code (the recorder's playback guard), so it
//! only signals the thread and never joins it. Starting blocks the caller
//! until the stream reports ready, bounded by [`READY_TIMEOUT`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::device::{PlaybackBuffer, PlaybackDevice};
use super::recorder::RecorderError;

/// Default output device of the default host
pub struct CpalPlayback {
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
    worker: Option<Worker>,
}

/// Longest wait for an output stream to start
pub const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Thread owning one output stream
struct Worker {
    stop_tx: Sender<()>,
}

impl Worker {
    /// Run `body` on its own thread and wait for it to report ready
    fn spawn<F>(body: F) -> Result<Self, RecorderError>
    where
        F: FnOnce(Sender<Result<(), RecorderError>>, Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        // Detached; the thread ends once it has dropped its stream
        std::thread::Builder::new()
            .name("speakercal-playback".into())
            .spawn(move || body(ready_tx, stop_rx))
            .map_err(|e| RecorderError::Device(e.to_string()))?;

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => Ok(Self { stop_tx }),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                let _ = stop_tx.send(());
                Err(RecorderError::Device("output stream did not start in time".into()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(RecorderError::Device("playback thread exited".into()))
            }
        }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
    }
}

impl CpalPlayback {
    /// Open the default output device (or the one named `device_name`)
    pub fn open(device_name: Option<&str>) -> Result<Self, RecorderError> {
        let device = find_device(device_name)?;
        let config = device
            .default_output_config()
            .map_err(|e| RecorderError::Device(e.to_string()))?;

        tracing::info!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            "Opened output device"
        );

        Ok(Self {
            device_name: device_name.map(str::to_owned),
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            worker: None,
        })
    }

    /// Names of the available output devices
    pub fn list_devices() -> Result<Vec<String>, RecorderError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| RecorderError::Device(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn find_device(name: Option<&str>) -> Result<cpal::Device, RecorderError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| RecorderError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| RecorderError::Device(format!("output device '{}' not found", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| RecorderError::Device("no default output device".into())),
    }
}

impl PlaybackDevice for CpalPlayback {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, buffer: PlaybackBuffer) -> Result<(), RecorderError> {
        self.stop();

        let device_name = self.device_name.clone();
        let config = StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(buffer.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let worker = Worker::spawn(move |ready_tx, stop_rx| {
            let stream = find_device(device_name.as_deref()).and_then(|device| {
                let samples: Arc<[f32]> = buffer.samples.into();
                let position = AtomicUsize::new(0);
                let channels = config.channels.max(1) as usize;
                let stream = device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            // Channel 0 carries the excitation, the rest stays silent
                            for frame in data.chunks_mut(channels) {
                                let i = position.fetch_add(1, Ordering::Relaxed);
                                frame.fill(0.0);
                                if let Some(&sample) = samples.get(i) {
                                    frame[0] = sample;
                                }
                            }
                        },
                        |err| tracing::error!("Output stream error: {}", err),
                        None,
                    )
                    .map_err(|e| RecorderError::Device(e.to_string()))?;
                stream
                    .play()
                    .map_err(|e| RecorderError::Device(e.to_string()))?;
                Ok(stream)
            });

            match stream {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_stop_does_not_wait_for_thread() {
        let (exited_tx, exited_rx) = crossbeam_channel::bounded(1);
        let worker = Worker::spawn(move |ready, stop| {
            let _ = ready.send(Ok(()));
            let _ = stop.recv();
            std::thread::sleep(Duration::from_millis(300));
            let _ = exited_tx.send(());
        })
        .unwrap();

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(exited_rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_stream_error_is_returned() {
        let result = Worker::spawn(|ready, _stop| {
            let _ = ready.send(Err(RecorderError::Device("device busy".into())));
        });
        match result {
            Err(RecorderError::Device(message)) => assert_eq!(message, "device busy"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("failed stream reported ready"),
        }
    }

    #[test]
    fn test_thread_exit_without_stream() {
        let result = Worker::spawn(|_ready, _stop| {});
        match result {
            Err(RecorderError::Device(message)) => assert!(message.contains("exited")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("exited thread reported ready"),
        }
    }
}
