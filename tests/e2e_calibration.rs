//! E2E tests for the calibration orchestrator
//!
//! Runs complete sessions against the simulated room and a local stand-in
//! for the remote analysis service.

use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use axum::extract::Path;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use speakercal::analysis::AnalysisClient;
use speakercal::{
    CalibrationConfig, CalibrationPhase, Calibrator, ImpulseResponseCalibration, MlsModule,
    SampleRates, SimulatedRoom, VolumeCalibration,
};
use tokio::sync::mpsc;

const RATE: u32 = 8000;

fn rates() -> SampleRates {
    SampleRates {
        source: RATE,
        sink: RATE,
    }
}

fn config(order: u32, rounds: u32) -> CalibrationConfig {
    CalibrationConfig {
        num_captures: 1,
        num_mls_per_capture: rounds,
        mls_order: order,
        playback_settle_ms: Some(10),
        inter_round_settle_ms: 5,
        ..Default::default()
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<CalibrationPhase>) -> Vec<CalibrationPhase> {
    let mut phases = Vec::new();
    while let Ok(phase) = rx.try_recv() {
        phases.push(phase);
    }
    phases
}

/// Scenario A: order 4, two rounds
#[tokio::test(start_paused = true)]
async fn test_two_rounds_order_four() {
    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::new(vec![1.0], RATE);
    let calibration = ImpulseResponseCalibration::new(config(4, 2), room.speaker())
        .unwrap()
        .with_module(module.clone());

    let report = calibration
        .calibrate(room.input_stream("room"), rates())
        .await
        .unwrap();

    assert_eq!(report.excitation.len(), 15);
    assert_eq!(report.recordings.len(), 2);
    assert_eq!(report.impulse_response.samples.len(), 16);
    assert_eq!(room.plays(), 2);
    assert_eq!(room.captures(), 2);
    assert_eq!(module.live_handles(), 0);
}

/// Rounds = captures x MLS per capture, each its own recording
#[tokio::test(start_paused = true)]
async fn test_round_count_multiplies() {
    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::new(vec![0.5], RATE);
    let mut cfg = config(5, 2);
    cfg.num_captures = 3;
    let calibration = ImpulseResponseCalibration::new(cfg, room.speaker())
        .unwrap()
        .with_module(module);

    let report = calibration
        .calibrate(room.input_stream("room"), rates())
        .await
        .unwrap();

    assert_eq!(report.recordings.len(), 6);
    let indices: Vec<usize> = report.recordings.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    assert_abs_diff_eq!(report.impulse_response.samples[0], 0.5, epsilon = 1e-5);
}

/// Scenario C: nothing captured, fails before finalizing
#[tokio::test(start_paused = true)]
async fn test_no_data_captured_fails_without_finalizing() {
    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::muted(RATE);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let calibration = ImpulseResponseCalibration::new(config(4, 2), room.speaker())
        .unwrap()
        .with_module(module.clone())
        .with_phase_observer(tx);

    let err = calibration
        .calibrate(room.input_stream("room"), rates())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "NoDataCapturedError");
    let phases = drain(&mut rx);
    assert!(!phases.contains(&CalibrationPhase::Finalizing));
    assert!(!phases.contains(&CalibrationPhase::RoundSettling { round: 0 }));
    assert_eq!(phases.last(), Some(&CalibrationPhase::Failed));
    assert_eq!(module.live_handles(), 0);
}

/// Repeated failing sessions leak no handles
#[tokio::test(start_paused = true)]
async fn test_repeated_failures_release_every_handle() {
    let module = MlsModule::load().await.unwrap();

    for _ in 0..5 {
        let room = SimulatedRoom::muted(RATE);
        let calibration = ImpulseResponseCalibration::new(config(4, 1), room.speaker())
            .unwrap()
            .with_module(module.clone());
        assert!(calibration
            .calibrate(room.input_stream("room"), rates())
            .await
            .is_err());
    }

    assert_eq!(module.acquired_handles(), 5);
    assert_eq!(module.released_handles(), 5);
    assert_eq!(module.live_handles(), 0);
}

/// Identical inputs give identical impulse responses
#[tokio::test(start_paused = true)]
async fn test_impulse_response_is_deterministic() {
    let module = MlsModule::load().await.unwrap();
    let ir = vec![0.0, 0.7, -0.25, 0.1];

    let mut results = Vec::new();
    for _ in 0..2 {
        let room = SimulatedRoom::new(ir.clone(), RATE);
        let calibration = ImpulseResponseCalibration::new(config(8, 1), room.speaker())
            .unwrap()
            .with_module(module.clone());
        let report = calibration
            .calibrate(room.input_stream("room"), rates())
            .await
            .unwrap();
        results.push(report.impulse_response.samples);
    }

    assert_eq!(results[0], results[1]);
    assert_abs_diff_eq!(results[0][1], 0.7, epsilon = 1e-5);
    assert_abs_diff_eq!(results[0][2], -0.25, epsilon = 1e-5);
}

/// Stand-in analysis service; records every request body
async fn spawn_analysis() -> (String, Arc<Mutex<Vec<Value>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let app = Router::new().route(
        "/task/{task}",
        post(move |Path(task): Path<String>, Json(body): Json<Value>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(body.clone());
                let result = match task.as_str() {
                    "volume" => json!({"dbfs": -12.5}),
                    "inverse-impulse-response" => {
                        let n = body["payload"].as_array().map(Vec::len).unwrap_or(0);
                        let mut inverse = vec![0.0; n];
                        if n > 0 {
                            inverse[0] = 1.0;
                        }
                        json!(inverse)
                    }
                    _ => Value::Null,
                };
                let mut response = serde_json::Map::new();
                response.insert(task, result);
                Json(Value::Object(response))
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), requests)
}

#[tokio::test]
async fn test_volume_through_analysis_service() {
    let (url, requests) = spawn_analysis().await;
    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::new(vec![0.5], RATE);
    let mut cfg = config(5, 2);
    cfg.analysis_url = Some(url);
    let calibration = VolumeCalibration::new(cfg, room.speaker())
        .unwrap()
        .with_module(module.clone());

    let report = calibration
        .calibrate(room.input_stream("room"), rates())
        .await
        .unwrap();

    assert_eq!(report.level, json!({"dbfs": -12.5}));
    assert_eq!(report.rounds, 2);
    assert_eq!(report.last_recording.index, 1);
    assert_eq!(module.live_handles(), 0);

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["task"], json!("volume"));
    assert_eq!(requests[0]["sample-rate"], json!(RATE));
    assert_eq!(requests[0]["payload"].as_array().map(Vec::len), Some(31));
}

#[tokio::test]
async fn test_inverse_filter_requested_after_impulse_response() {
    let (url, requests) = spawn_analysis().await;
    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::new(vec![1.0], RATE);
    let calibration = ImpulseResponseCalibration::new(config(4, 1), room.speaker())
        .unwrap()
        .with_module(module)
        .with_analysis(AnalysisClient::new(url).unwrap());

    let report = calibration
        .calibrate(room.input_stream("room"), rates())
        .await
        .unwrap();

    let inverse = report.inverse_impulse_response.unwrap();
    assert_eq!(inverse.len(), 16);
    assert_abs_diff_eq!(inverse[0], 1.0);

    let requests = requests.lock().unwrap();
    assert_eq!(requests[0]["task"], json!("inverse-impulse-response"));
    assert!(requests[0].get("sample-rate").is_none());
    assert!(requests[0].get("P").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_export_writes_wav_files() {
    let dir = tempfile::tempdir().unwrap();
    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::new(vec![1.0], RATE);
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
    assert!(export_dir.starts_with(dir.path()));
    let (excitation, rate) = speakercal::audio::wav::read_file(&export_dir.join("excitation.wav")).unwrap();
    assert_eq!(excitation.len(), 15);
    assert_eq!(rate, RATE);
    assert!(export_dir.join("round-00.wav").exists());
    assert!(export_dir.join("round-01.wav").exists());
    assert!(!export_dir.join("inverse-impulse-response.wav").exists());
}
