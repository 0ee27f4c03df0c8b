//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use cam_server::timelapse::{EncodeError, EncodeJob, EncodeReport, VideoEncoder};
use cam_server::{FrameSource, SourceError};
use futures_util::future::BoxFuture;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Small JPEG whose colour depends on `seed`.
pub fn jpeg(seed: usize) -> Vec<u8> {
    let shade = (seed * 10 % 256) as u8;
    let image = RgbImage::from_fn(16, 12, |x, y| Rgb([shade, (x * 16) as u8, (y * 20) as u8]));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90).encode_image(&image).unwrap();
    out
}

/// Camera producing a JPEG every `interval`, optionally failing after a
/// number of frames.
pub struct FakeCamera {
    interval: Duration,
    fail_after: Option<usize>,
    produced: usize,
    frame: Vec<u8>,
}

impl FakeCamera {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            fail_after: None,
            produced: 0,
            frame: Vec::new(),
        }
    }

    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl FrameSource for FakeCamera {
    fn start_streaming(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        if self.fail_after.is_some_and(|n| self.produced >= n) {
            return Err(SourceError::Device("camera unplugged".into()));
        }
        if self.interval > timeout {
            thread::sleep(timeout);
            return Err(SourceError::Timeout);
        }
        thread::sleep(self.interval);
        self.frame = jpeg(self.produced);
        self.produced += 1;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<&[u8], SourceError> {
        Ok(&self.frame)
    }
}

/// Video encoder that records its jobs and writes a placeholder file.
#[derive(Default)]
pub struct RecordingEncoder {
    jobs: Mutex<Vec<EncodeJob>>,
    pub encoded: Notify,
}

impl RecordingEncoder {
    pub fn jobs(&self) -> Vec<EncodeJob> {
        self.jobs.lock().clone()
    }
}

impl VideoEncoder for RecordingEncoder {
    fn encode<'a>(&'a self, job: &'a EncodeJob) -> BoxFuture<'a, Result<EncodeReport, EncodeError>> {
        Box::pin(async move {
            tokio::fs::write(&job.output, b"video")
                .await
                .map_err(|source| EncodeError::Spawn {
                    program: "recording".into(),
                    source,
                })?;
            self.jobs.lock().push(job.clone());
            self.encoded.notify_one();
            Ok(EncodeReport {
                elapsed: Duration::from_millis(1),
                output: String::new(),
            })
        })
    }
}
