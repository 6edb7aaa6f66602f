//! Speakercal - acoustic calibration over a peer connection
//!
//! Entry point for the command-line tool.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use speakercal::analysis::{AnalysisClient, AnalysisTask};
use speakercal::audio::device::PlaybackDevice;
use speakercal::audio::signal::period;
use speakercal::audio::wav;
use speakercal::server::{AppState, Outcome, PeerHub, ServerConfig};
use speakercal::{
    CalibrationConfig, Calibrator, ImpulseResponseCalibration, ImpulseResponseReport, MlsModule,
    SampleRates, SessionError, SimulatedRoom, Speaker, SpeakerOptions, VolumeCalibration,
    VolumeReport,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Room used by `simulate`: direct sound at 2 samples plus a short tail
const SIMULATED_ROOM: [f64; 8] = [0.0, 0.0, 0.8, 0.35, -0.2, 0.1, 0.05, -0.02];

/// Sample rate of the simulated room and exported excitations
const SIMULATION_RATE: u32 = 48000;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for a listener and run one calibration
    Serve {
        #[arg(short, long, default_value_t = ServerConfig::default().port)]
        port: u16,
        /// Config file (default: the per-user config)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Measure the sound level instead of the impulse response
        #[arg(long)]
        volume: bool,
        /// Output device name (`cpal` builds only)
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Measure a simulated room and print the recovered impulse response
    Simulate {
        #[arg(short, long, default_value_t = 12)]
        order: u32,
        #[arg(short, long, default_value_t = 2)]
        rounds: u32,
    },
    /// Write an MLS excitation to a WAV file
    Mls {
        #[arg(short, long, default_value_t = speakercal::DEFAULT_MLS_ORDER)]
        order: u32,
        #[arg(short, long, default_value_t = SIMULATION_RATE)]
        rate: u32,
        #[arg(long)]
        output: PathBuf,
    },
    /// Send a captured WAV file to the analysis service
    Analyze {
        #[arg(short, long)]
        task: AnalysisTask,
        #[arg(short, long)]
        input: PathBuf,
        /// Service URL (default: `analysis_url` from the config)
        #[arg(short, long)]
        url: Option<String>,
        /// MLS order of the capture, for `impulse-response`
        #[arg(short, long)]
        order: Option<u32>,
    },
    /// Print the effective configuration
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Write it back (fills in defaults)
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("speakercal=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            config,
            volume,
            device,
        } => serve(port, config.as_deref(), volume, device.as_deref()).await,
        Command::Simulate { order, rounds } => simulate(order, rounds).await,
        Command::Mls {
            order,
            rate,
            output,
        } => export_mls(order, rate, &output).await,
        Command::Analyze {
            task,
            input,
            url,
            order,
        } => analyze(task, &input, url, order).await,
        Command::Config { config, save } => show_config(config.as_deref(), save),
    }
}

fn load_config(path: Option<&Path>) -> CalibrationConfig {
    match path {
        Some(path) => CalibrationConfig::load_from(path),
        None => CalibrationConfig::load(),
    }
}

#[cfg(feature = "cpal")]
fn open_playback(device: Option<&str>) -> Result<Box<dyn PlaybackDevice>> {
    use speakercal::audio::playback::CpalPlayback;

    match CpalPlayback::open(device) {
        Ok(playback) => Ok(Box::new(playback)),
        Err(e) => {
            if let Ok(names) = CpalPlayback::list_devices() {
                info!(available = ?names, "Output devices");
            }
            Err(e).context("Failed to open output device")
        }
    }
}

#[cfg(not(feature = "cpal"))]
fn open_playback(device: Option<&str>) -> Result<Box<dyn PlaybackDevice>> {
    if device.is_some() {
        anyhow::bail!("Output device selection needs a build with the `cpal` feature");
    }
    warn!("Built without the `cpal` feature, the excitation will not be audible");
    Ok(SimulatedRoom::muted(speakercal::DEFAULT_SAMPLE_RATE).speaker())
}

async fn serve(port: u16, config: Option<&Path>, volume: bool, device: Option<&str>) -> Result<()> {
    let config = load_config(config);
    config.validate().context("Invalid configuration")?;
    let playback = open_playback(device)?;

    let (hub, events) = PeerHub::new();
    let mut speaker = Speaker::new(hub.control(), SpeakerOptions::from(&config));
    let state = AppState::new(
        hub.clone(),
        speaker.subscribe(),
        ServerConfig {
            port,
            ..Default::default()
        },
    );

    let server_state = state.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = speakercal::server::start_server(server_state).await {
            error!("Web server error: {:#}", e);
        }
    });

    println!(
        "Listener URL: {}",
        speakercal::server::api::local_listener_url(port, &hub.peer_id())
    );

    let attempt = async {
        if volume {
            let calibration = VolumeCalibration::new(config.clone(), playback)?;
            let report = speaker.start_calibration(events, calibration).await?;
            Ok::<_, SessionError>(describe_volume(&report))
        } else {
            let calibration = ImpulseResponseCalibration::new(config.clone(), playback)?;
            let report = speaker.start_calibration(events, calibration).await?;
            Ok(describe_impulse(&report))
        }
    };

    let result = tokio::select! {
        result = attempt => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.abort();
            return Ok(());
        }
    };

    let outcome = match &result {
        Ok(summary) => {
            println!("{}", summary);
            Outcome::success(summary.clone())
        }
        Err(e) => {
            eprintln!("Calibration failed ({}): {}", e.kind(), e);
            Outcome::failure(e.kind(), e.to_string())
        }
    };
    state.record_outcome(outcome);
    server.abort();

    result.map(|_| ()).map_err(anyhow::Error::from)
}

fn describe_impulse(report: &ImpulseResponseReport) -> String {
    let ir = &report.impulse_response;
    let (peak_index, peak) = ir
        .samples
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, v)| (i, *v))
        .unwrap_or((0, 0.0));
    let mut summary = format!(
        "Impulse response: {} samples at {} Hz from {} round(s), peak {:.4} at sample {}",
        ir.samples.len(),
        ir.sample_rate,
        report.recordings.len(),
        peak,
        peak_index
    );
    if let Some(inverse) = &report.inverse_impulse_response {
        summary.push_str(&format!(", inverse filter {} taps", inverse.len()));
    }
    if let Some(dir) = &report.export_dir {
        summary.push_str(&format!(", exported to {}", dir.display()));
    }
    summary
}

fn describe_volume(report: &VolumeReport) -> String {
    let mut summary = format!("Volume: {} from {} round(s)", report.level, report.rounds);
    if let Some(dir) = &report.export_dir {
        summary.push_str(&format!(", exported to {}", dir.display()));
    }
    summary
}

async fn simulate(order: u32, rounds: u32) -> Result<()> {
    let config = CalibrationConfig {
        num_mls_per_capture: rounds,
        mls_order: order,
        inter_round_settle_ms: 10,
        ..CalibrationConfig::load()
    };
    let room = SimulatedRoom::new(SIMULATED_ROOM.to_vec(), SIMULATION_RATE);
    let calibration = ImpulseResponseCalibration::new(config, room.speaker())
        .context("Invalid simulation settings")?;
    let rates = SampleRates {
        source: calibration.playback_sample_rate(),
        sink: room.sample_rate(),
    };

    info!(order, rounds, "Simulating measurement");
    let report = calibration
        .calibrate(room.input_stream("simulated"), rates)
        .await
        .context("Simulated calibration failed")?;

    println!("{}", describe_impulse(&report));
    println!("{:>6}  {:>10}  {:>10}", "tap", "measured", "room");
    for (i, measured) in report.impulse_response.samples.iter().take(12).enumerate() {
        let actual = SIMULATED_ROOM.get(i).copied().unwrap_or(0.0);
        println!("{:>6}  {:>10.5}  {:>10.5}", i, measured, actual);
    }
    Ok(())
}

async fn export_mls(order: u32, rate: u32, output: &Path) -> Result<()> {
    let module = MlsModule::shared().await?;
    let mut handle = module.create().await?;
    let signal = handle.generate(order);
    handle.release();
    let signal = signal.with_context(|| format!("Cannot generate order {}", order))?;

    wav::write_file(output, signal.samples(), rate)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} samples ({:.3} s at {} Hz) to {}",
        signal.len(),
        signal.duration(rate).as_secs_f64(),
        rate,
        output.display()
    );
    Ok(())
}

async fn analyze(task: AnalysisTask, input: &Path, url: Option<String>, order: Option<u32>) -> Result<()> {
    let url = url
        .or_else(|| CalibrationConfig::load().analysis_url)
        .context("No analysis service URL (pass --url or set analysis_url)")?;
    let client = AnalysisClient::new(url)?;
    let (samples, rate) = wav::read_file(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let result = match task {
        AnalysisTask::ImpulseResponse => {
            let p = order.map(period).unwrap_or(samples.len());
            serde_json::to_value(client.impulse_response(&samples, rate, p).await?)?
        }
        AnalysisTask::InverseImpulseResponse => {
            let ir: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
            serde_json::to_value(client.inverse_impulse_response(&ir).await?)?
        }
        AnalysisTask::Volume => client.volume(&samples, rate).await?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn show_config(path: Option<&Path>, save: bool) -> Result<()> {
    let config = load_config(path);
    if let Err(e) = config.validate() {
        warn!(kind = e.kind(), "Configuration does not validate: {}", e);
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    if save {
        let target = path.map(Path::to_path_buf).unwrap_or_else(CalibrationConfig::path);
        config.save(&target)?;
        println!("Saved to {}", target.display());
    }
    Ok(())
}
