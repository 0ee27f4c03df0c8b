//! Webcam capture, live MJPEG broadcast and timelapse recording
//!
//! One capture loop feeds one encoder, which hands every encoded frame to all
//! consumers waiting at that moment: HTTP stream clients, snapshot requests and
//! the timelapse recorder. A [`lifecycle::Lifecycle`] supervises the workers
//! and drives the graceful shutdown.

pub mod app;
pub mod broadcast;
pub mod capture;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod handoff;
pub mod http;
pub mod lifecycle;
pub mod stats;
pub mod timelapse;

pub use broadcast::FrameBroadcaster;
pub use capture::{CaptureLoop, CaptureSettings, FrameSource, SourceError, TestPatternSource};
#[cfg(feature = "v4l2")]
pub use capture::V4l2Source;
pub use codec::{FrameCodec, JpegTranscoder};
pub use config::Config;
pub use error::{Error, Result};
pub use frame::{EncodedFrame, RawFrame};
pub use lifecycle::{Lifecycle, Shutdown, ShutdownOutcome, ShutdownTrigger};
pub use timelapse::{FfmpegEncoder, TimelapseRecorder, VideoEncoder};
