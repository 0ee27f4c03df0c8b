//! cam-server CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cam_server::app::{self, Backends};
use cam_server::config::Config;
use cam_server::lifecycle::forward_os_signals;
use cam_server::{FfmpegEncoder, FrameSource, JpegTranscoder, TestPatternSource};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cam-server")]
#[command(about = "Webcam MJPEG stream, snapshot and timelapse server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overrides APP_PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Camera device path
    #[arg(short, long)]
    device: Option<String>,

    /// Serve a synthetic test pattern instead of a camera
    #[arg(long)]
    test_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cam server");

    let mut config = match &cli.config {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };
    config.apply_env()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(device) = &cli.device {
        config.camera.device = device.clone();
    }
    config.validate()?;

    info!(
        addr = %config.bind_addr(),
        device = %config.camera.device,
        timelapse_interval_mins = config.timelapse.interval_mins,
        timelapse_dir = %config.timelapse.output_dir.display(),
        "Configuration loaded"
    );

    let source: Box<dyn FrameSource> = if cli.test_mode {
        info!("Test mode: serving a synthetic test pattern");
        Box::new(TestPatternSource::new(
            config.camera.width,
            config.camera.height,
            config.camera.fps,
        ))
    } else {
        open_camera(&config)?
    };

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    let interrupts = forward_os_signals().context("installing signal handlers")?;

    let backends = Backends {
        source,
        codec: Arc::new(JpegTranscoder::new(config.camera.jpeg_quality)),
        video_encoder: Arc::new(FfmpegEncoder::new(&config.timelapse.encoder_program)),
    };

    let shutdown = app::run(&config, listener, backends, interrupts).await;
    std::process::exit(shutdown.exit_code());
}

#[cfg(feature = "v4l2")]
fn open_camera(config: &Config) -> Result<Box<dyn FrameSource>> {
    let source = cam_server::V4l2Source::open(&config.camera.device, config.camera.width, config.camera.height)
        .with_context(|| format!("opening camera {}", config.camera.device))?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "v4l2"))]
fn open_camera(_config: &Config) -> Result<Box<dyn FrameSource>> {
    anyhow::bail!("built without V4L2 support; rebuild with `--features v4l2` or run with --test-mode")
}
