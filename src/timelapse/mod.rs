//! Timelapse recording
//!
//! On every tick the recorder takes one fresh frame from the broadcaster,
//! stores it as `<unix seconds>.jpg` in the output directory and re-encodes the
//! whole still sequence into `timelapse.mp4`. How long that encode took is
//! compared against the tick interval and logged as a health signal.

mod ffmpeg;

pub use ffmpeg::{EncodeError, EncodeJob, EncodeReport, FfmpegEncoder, VideoEncoder};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::FrameBroadcaster;
use crate::frame::EncodedFrame;
use crate::stats::PipelineStats;

pub const VIDEO_FILE_NAME: &str = "timelapse.mp4";
const VIDEO_FORMAT: &str = "mp4";
const STILL_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum TimelapseError {
    #[error("timelapse I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl TimelapseError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelapseSettings {
    pub interval: Duration,
    pub output_dir: PathBuf,
    pub framerate: u32,
}

impl TimelapseSettings {
    pub fn video_path(&self) -> PathBuf {
        self.output_dir.join(VIDEO_FILE_NAME)
    }

    /// Where the encoder writes before the video replaces the published one.
    pub fn partial_video_path(&self) -> PathBuf {
        self.output_dir.join(format!("{VIDEO_FILE_NAME}.part"))
    }

    fn still_glob(&self) -> PathBuf {
        self.output_dir.join(format!("*.{STILL_EXTENSION}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelapsePhase {
    Idle,
    WaitingForTick,
    Sampling,
    Encoding,
    Stopped,
}

/// How an encode's duration compares with the sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeHealth {
    Healthy,
    /// At least half the interval.
    Slow,
    /// At least the whole interval; the published video falls behind.
    Lagging,
}

pub fn classify_encode_duration(elapsed: Duration, interval: Duration) -> EncodeHealth {
    if elapsed >= interval {
        EncodeHealth::Lagging
    } else if elapsed >= interval / 2 {
        EncodeHealth::Slow
    } else {
        EncodeHealth::Healthy
    }
}

fn format_minutes_seconds(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}m{}s", secs / 60, secs % 60)
}

pub struct TimelapseRecorder {
    settings: TimelapseSettings,
    frames: FrameBroadcaster,
    encoder: Arc<dyn VideoEncoder>,
    stats: Arc<PipelineStats>,
    phase: watch::Sender<TimelapsePhase>,
}

impl TimelapseRecorder {
    pub fn new(
        settings: TimelapseSettings,
        frames: FrameBroadcaster,
        encoder: Arc<dyn VideoEncoder>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let (phase, _) = watch::channel(TimelapsePhase::Idle);
        Self {
            settings,
            frames,
            encoder,
            stats,
            phase,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TimelapsePhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: TimelapsePhase) {
        self.phase.send_replace(phase);
    }

    /// Tick until cancelled. The first tick fires one interval after start.
    ///
    /// A cycle that has already written its still finishes its encode even if
    /// cancellation arrives meanwhile; no new cycle starts afterwards.
    pub async fn run(self, token: CancellationToken) -> Result<(), TimelapseError> {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            output_dir = %self.settings.output_dir.display(),
            "Starting timelapse recorder"
        );

        let result = self.tick_loop(&token).await;
        self.enter(TimelapsePhase::Stopped);
        info!("Timelapse recorder stopped");
        result
    }

    async fn tick_loop(&self, token: &CancellationToken) -> Result<(), TimelapseError> {
        let dir = &self.settings.output_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(TimelapseError::io(dir))?;

        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.enter(TimelapsePhase::WaitingForTick);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            self.enter(TimelapsePhase::Sampling);
            let Ok(frame) = self.frames.snapshot(token).await else {
                debug!("Cancelled while sampling, no still written");
                return Ok(());
            };
            self.write_still(&frame).await?;

            self.enter(TimelapsePhase::Encoding);
            self.encode_video().await?;
        }
    }

    async fn write_still(&self, frame: &EncodedFrame) -> Result<PathBuf, TimelapseError> {
        let captured = SystemTime::now();
        let secs = captured.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        let path = self.settings.output_dir.join(format!("{secs}.{STILL_EXTENSION}"));
        // Written under a name the encode glob does not match, then renamed.
        let partial = path.with_extension(format!("{STILL_EXTENSION}.part"));

        tokio::fs::write(&partial, frame.bytes())
            .await
            .map_err(TimelapseError::io(&partial))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(TimelapseError::io(&path))?;

        self.stats.record_still();
        info!(path = %path.display(), timestamp = secs, bytes = frame.len(), "Recorded timelapse still");
        Ok(path)
    }

    async fn encode_video(&self) -> Result<(), TimelapseError> {
        let job = EncodeJob {
            input_glob: self.settings.still_glob(),
            output: self.settings.partial_video_path(),
            framerate: self.settings.framerate,
            stream_copy: false,
            format: Some(VIDEO_FORMAT),
        };

        let report = self.encoder.encode(&job).await?;
        debug!(output = %report.output, "Video encoder output");

        // Readers of the published video keep the file they opened.
        let video = self.settings.video_path();
        tokio::fs::rename(&job.output, &video)
            .await
            .map_err(TimelapseError::io(&video))?;

        let interval = self.settings.interval;
        let took = format_minutes_seconds(report.elapsed);
        let limit = format_minutes_seconds(interval);
        match classify_encode_duration(report.elapsed, interval) {
            EncodeHealth::Lagging => error!(
                took = %took,
                interval = %limit,
                "Timelapse encoding took longer than the capture interval"
            ),
            EncodeHealth::Slow => warn!(
                took = %took,
                interval = %limit,
                "Timelapse encoding took more than half the capture interval"
            ),
            EncodeHealth::Healthy => info!(took = %took, "Timelapse encoded"),
        }
        Ok(())
    }
}

/// Render the current stills into a fresh Matroska file and return its bytes.
///
/// The file is written next to the stills under a unique name and removed
/// again before returning.
pub async fn render_on_demand(
    encoder: &dyn VideoEncoder,
    settings: &TimelapseSettings,
) -> Result<Bytes, TimelapseError> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let output = settings.output_dir.join(format!("render-{nanos}.mkv"));

    let job = EncodeJob {
        input_glob: settings.still_glob(),
        output: output.clone(),
        framerate: settings.framerate,
        stream_copy: true,
        format: None,
    };

    let rendered = match encoder.encode(&job).await {
        Ok(report) => {
            debug!(elapsed_ms = report.elapsed.as_millis() as u64, "On-demand render finished");
            tokio::fs::read(&output)
                .await
                .map(Bytes::from)
                .map_err(TimelapseError::io(&output))
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = tokio::fs::remove_file(&output).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %output.display(), error = %e, "Failed to remove rendered timelapse");
        }
    }

    rendered
}
