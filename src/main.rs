//! CF-Cam capture binary: runs the capture session and prints ROI readings.

use std::error::Error;
use std::path::PathBuf;

use cf_cam_capture::config::Config;
use cf_cam_capture::device::{list_devices, DevicePermissions, V4L2Provider, V4L2Session};
use cf_cam_capture::{CaptureService, DeviceKind, Presentation, SessionEvent, SessionState};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cf-cam")]
#[command(about = "Fluorescence accessory capture with live ROI brightness readout")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/cf-cam/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exposure duration in seconds
    #[arg(long)]
    exposure: Option<f64>,

    /// Sensor gain (ISO)
    #[arg(long)]
    gain: Option<f32>,

    /// Illumination level between 0 and 1
    #[arg(long)]
    illumination: Option<f32>,

    /// Camera to use: ultra-wide, wide or telephoto
    #[arg(long)]
    camera: Option<DeviceKind>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List video devices and whether they offer the 10-bit capture format
    ListDevices,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging.filter);

    if matches!(cli.command, Some(Commands::ListDevices)) {
        print_devices();
        return Ok(());
    }

    if let Some(exposure) = cli.exposure {
        config.capture.exposure_seconds = exposure;
    }
    if let Some(gain) = cli.gain {
        config.capture.gain = gain;
    }
    if let Some(illumination) = cli.illumination {
        config.capture.illumination = illumination;
    }
    if cli.camera.is_some() {
        config.capture.camera = cli.camera;
    }

    let (service, presentation) = CaptureService::spawn(
        V4L2Provider::new(config.devices.clone()),
        V4L2Session::new(),
        DevicePermissions::for_devices(&config.devices),
        config.capture_settings(),
    )?;
    service.initialize()?;
    service.start()?;
    if let Some(kind) = config.capture.camera {
        service.switch_camera(kind)?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(present(presentation));
    match service.snapshot() {
        Ok(snapshot) => println!("Frames: {}", snapshot.frames),
        Err(err) => debug!(error = %err, "No final snapshot"),
    }
    service.shutdown();
    outcome
}

fn init_logging(configured: &str) {
    // RUST_LOG wins over the config file
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured)),
        )
        .with_target(true)
        .with_level(true)
        .init();
}

fn print_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("No video devices found");
        return;
    }
    for device in devices {
        let marker = if device.supports_required_format {
            "10-bit"
        } else {
            "-"
        };
        println!(
            "{:>2}  {:<14} {:<7} {}",
            device.index,
            device.path.display(),
            marker,
            device.name
        );
    }
}

async fn present(mut presentation: Presentation) -> Result<(), Box<dyn Error>> {
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut sampling = true;

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            event = presentation.events.recv() => match event {
                Some(SessionEvent::StateChanged(SessionState::Failed(reason))) => {
                    return Err(format!("capture session failed: {reason}").into());
                }
                Some(SessionEvent::StateChanged(state)) => info!(state = %state, "Session state"),
                Some(SessionEvent::CameraActivated { kind, format }) => {
                    println!("Camera: {kind} ({format})");
                }
                Some(SessionEvent::SettingsApplied(effective)) => {
                    println!("{}", effective.readout());
                }
                Some(SessionEvent::ConfigurationFailed(message)) => {
                    warn!(error = %message, "Settings not applied");
                }
                Some(SessionEvent::WrongFormatFatal) => {
                    eprintln!("Camera stopped delivering 10-bit frames");
                }
                None => return Ok(()),
            },
            changed = presentation.metric.changed(), if sampling => {
                if changed.is_err() {
                    debug!("Frame worker stopped");
                    sampling = false;
                    continue;
                }
                if let Some(metric) = *presentation.metric.borrow_and_update() {
                    println!("{metric}");
                }
            }
        }
    }
}
