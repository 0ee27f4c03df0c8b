//! Wires the pipeline workers into one lifecycle.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use crate::broadcast::FrameBroadcaster;
use crate::capture::{CaptureLoop, FrameSource};
use crate::codec::FrameCodec;
use crate::config::Config;
use crate::encoder::FrameEncoder;
use crate::error::Error;
use crate::handoff::Handoff;
use crate::http::{self, AppState};
use crate::lifecycle::{Lifecycle, Shutdown};
use crate::stats::PipelineStats;
use crate::timelapse::{TimelapseRecorder, VideoEncoder};

/// The pluggable ends of the pipeline.
pub struct Backends {
    pub source: Box<dyn FrameSource>,
    pub codec: Arc<dyn FrameCodec>,
    pub video_encoder: Arc<dyn VideoEncoder>,
}

/// Run capture, encoder, timelapse and http workers until shutdown.
///
/// `interrupts` carries external stop requests; the first starts a graceful
/// shutdown and a second one forces it.
pub async fn run(
    config: &Config,
    listener: TcpListener,
    backends: Backends,
    interrupts: mpsc::Receiver<()>,
) -> Shutdown {
    let lifecycle = Lifecycle::new(config.graceful_timeout(), config.lifecycle.error_capacity);
    let token = lifecycle.token();
    let stats = Arc::new(PipelineStats::new());
    let raw = Arc::new(Handoff::new());
    let frames = FrameBroadcaster::new(config.broadcast.max_fanout);

    let capture = CaptureLoop::new(backends.source, config.capture_settings(), Arc::clone(&stats));
    {
        let raw = Arc::clone(&raw);
        let token = token.clone();
        lifecycle.spawn_blocking("capture", move || capture.run(&raw, &token).map_err(Error::from));
    }

    let encoder = FrameEncoder::new(backends.codec, Arc::clone(&stats));
    {
        let frames = frames.clone();
        let token = token.clone();
        lifecycle.spawn("encoder", async move {
            encoder.run(raw, frames, token).await.map_err(Error::from)
        });
    }

    let recorder = TimelapseRecorder::new(
        config.timelapse_settings(),
        frames.clone(),
        Arc::clone(&backends.video_encoder),
        Arc::clone(&stats),
    );
    let phase = recorder.subscribe();
    {
        let token = token.clone();
        lifecycle.spawn("timelapse", async move { recorder.run(token).await.map_err(Error::from) });
    }

    let state = AppState::new(
        frames,
        Arc::clone(&stats),
        config.timelapse_settings(),
        backends.video_encoder,
        phase,
        token,
    );
    let read_timeout = config.read_timeout();
    lifecycle.spawn("http", async move {
        http::serve(listener, state, read_timeout).await.map_err(Error::Http)
    });

    let shutdown = lifecycle.run(interrupts).await;

    let totals = stats.snapshot();
    info!(
        captured = totals.frames_captured,
        dropped = totals.frames_dropped,
        encoded = totals.frames_encoded,
        served = totals.consumers_served,
        stills = totals.timelapse_stills,
        drop_rate = totals.drop_rate(),
        mean_fan_out = totals.mean_fan_out(),
        exit_code = shutdown.exit_code(),
        "Cam server stopped"
    );
    shutdown
}
