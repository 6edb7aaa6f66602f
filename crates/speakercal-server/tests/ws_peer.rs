//! WebSocket peer transport tests
//!
//! Runs the server on an ephemeral port and drives it with a scripted
//! listener that echoes the excitation back as its microphone capture.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use speakercal_core::audio::signal::MlsSequence;
use speakercal_core::audio::simulated::SimulatedRoom;
use speakercal_core::peer::{ConnectionState, Speaker, SpeakerOptions, BUSY_NOTICE};
use speakercal_core::{CalibrationConfig, ImpulseResponseCalibration, MlsModule};
use speakercal_server::{AppState, PeerHub, ServerConfig};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const ORDER: u32 = 5;
const RATE: u32 = 8000;

async fn spawn_server(hub: PeerHub, state_rx: tokio::sync::watch::Receiver<ConnectionState>) -> (String, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(
        hub,
        state_rx,
        ServerConfig {
            port: addr.port(),
            bind_addr: "127.0.0.1".into(),
        },
    );
    let served = state.clone();
    tokio::spawn(async move {
        speakercal_server::serve(listener, served).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), state)
}

fn peer_url(addr: &str, peer_id: &str) -> String {
    format!("ws://{}/api/v1/peer?speakerPeerId={}", addr, peer_id)
}

fn text(name: &str, payload: Value) -> Message {
    Message::text(json!({"name": name, "payload": payload}).to_string())
}

fn frame_name(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(t) => serde_json::from_str::<Value>(t.as_str())
            .ok()?
            .get("name")?
            .as_str()
            .map(str::to_owned),
        _ => None,
    }
}

fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn config() -> CalibrationConfig {
    CalibrationConfig {
        num_captures: 1,
        num_mls_per_capture: 2,
        mls_order: ORDER,
        playback_settle_ms: Some(20),
        inter_round_settle_ms: 5,
        timeout_ms: 10_000,
        busy_grace_ms: 100,
        ..Default::default()
    }
}

/// Full session: the listener's capture is the excitation itself, so the
/// measured response is a unit impulse
#[tokio::test]
async fn test_session_over_websocket() {
    let (hub, events) = PeerHub::new();
    let mut speaker = Speaker::new(hub.control(), SpeakerOptions::from(&config()));
    let (addr, state) = spawn_server(hub.clone(), speaker.subscribe()).await;

    let module = MlsModule::load().await.unwrap();
    let room = SimulatedRoom::muted(RATE);
    let calibration = ImpulseResponseCalibration::new(config(), room.speaker())
        .unwrap()
        .with_module(module.clone());

    let url = peer_url(&addr, &hub.peer_id());
    let listener = tokio::spawn(async move {
        let capture = MlsSequence::new(ORDER).unwrap().to_signal();
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(text("samplingRate", json!(RATE))).await.unwrap();
        ws.send(text("call", json!({"sampleRate": RATE, "encoding": "pcm-f32le"})))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            let Some(name) = frame_name(&msg) else {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                continue;
            };
            if name == "stopRecording" {
                let bytes = pcm_bytes(capture.samples());
                let (head, tail) = bytes.split_at(bytes.len() / 2);
                ws.send(Message::binary(head.to_vec())).await.unwrap();
                ws.send(Message::binary(tail.to_vec())).await.unwrap();
                ws.send(text("recordingStopped", Value::Null)).await.unwrap();
            }
            seen.push(name);
        }
        seen
    });

    let report = speaker
        .start_calibration(events, calibration)
        .await
        .expect("calibration should succeed");

    let ir = &report.impulse_response.samples;
    assert_eq!(ir.len(), 32);
    assert!((ir[0] - 1.0).abs() < 1e-4, "ir[0] = {}", ir[0]);
    assert!(ir[1..].iter().all(|v| v.abs() < 1e-4));
    assert_eq!(report.recordings.len(), 2);
    assert_eq!(report.sample_rates.sink, RATE);
    assert_eq!(module.live_handles(), 0);
    assert_eq!(state.hub.connections(), 1);

    let seen = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener should see the socket close")
        .unwrap();
    assert_eq!(seen.first().map(String::as_str), Some("answer"));
    assert_eq!(seen.iter().filter(|n| *n == "startRecording").count(), 2);
    assert_eq!(seen.iter().filter(|n| *n == "stopRecording").count(), 2);
}

#[tokio::test]
async fn test_wrong_speaker_id_rejected() {
    let (hub, _events) = PeerHub::new();
    let (_tx, state_rx) = tokio::sync::watch::channel(ConnectionState::Open);
    let (addr, _state) = spawn_server(hub, state_rx).await;

    let result = tokio_tungstenite::connect_async(peer_url(&addr, "not-the-speaker")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }

    let missing = tokio_tungstenite::connect_async(format!("ws://{}/api/v1/peer", addr)).await;
    assert!(missing.is_err());
}

/// A second listener gets the busy notice and is closed; the first keeps
/// its connection
#[tokio::test]
async fn test_second_listener_gets_busy_notice() {
    let (hub, events) = PeerHub::new();
    let options = SpeakerOptions {
        timeout: Duration::from_millis(1500),
        busy_grace: Duration::from_millis(100),
    };
    let mut speaker = Speaker::new(hub.control(), options);
    let mut state_rx = speaker.subscribe();
    let (addr, _state) = spawn_server(hub.clone(), speaker.subscribe()).await;

    let room = SimulatedRoom::muted(RATE);
    let calibration = ImpulseResponseCalibration::new(config(), room.speaker()).unwrap();
    let session = tokio::spawn(async move { speaker.start_calibration(events, calibration).await });

    let url = peer_url(&addr, &hub.peer_id());
    let (_first, _) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
    state_rx
        .wait_for(|s| *s == ConnectionState::Ready)
        .await
        .unwrap();

    let (mut second, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let notice = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        notice,
        Message::text(Value::String(BUSY_NOTICE.into()).to_string())
    );

    let closed = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .unwrap();
    assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    assert_eq!(*state_rx.borrow(), ConnectionState::Ready);

    // No call ever arrives
    let err = session.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "CalibrationTimedOutError");
}

#[tokio::test]
async fn test_status_reports_peer() {
    let (hub, _events) = PeerHub::new();
    let (_tx, state_rx) = tokio::sync::watch::channel(ConnectionState::AwaitingConnection);
    let (addr, state) = spawn_server(hub.clone(), state_rx).await;
    state.record_outcome(speakercal_server::Outcome::failure(
        "MissingSampleRateError",
        "Far end never announced its sample rate",
    ));

    let status: Value = reqwest::get(format!("http://{}/api/v1/status", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["peer_id"], json!(hub.peer_id()));
    assert_eq!(status["state"], json!("awaitingConnection"));
    assert_eq!(status["last_outcome"]["kind"], json!("MissingSampleRateError"));

    let listener: Value = reqwest::get(format!("http://{}/api/v1/listener-url", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = listener["url"].as_str().unwrap();
    assert!(url.ends_with(&format!("/api/v1/peer?speakerPeerId={}", hub.peer_id())));
}
