//! Synthetic frame source for running without camera hardware.

use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use super::{FrameSource, SourceError};

/// Moving colour gradient, JPEG encoded, at a fixed frame rate.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    interval: Duration,
    next_frame: Instant,
    sequence: u64,
    frame: Vec<u8>,
    streaming: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            next_frame: Instant::now(),
            sequence: 0,
            frame: Vec::new(),
            streaming: false,
        }
    }

    fn render(&mut self) -> Result<(), SourceError> {
        let shift = (self.sequence * 4 % 256) as u32;
        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                (self.sequence % 256) as u8,
            ])
        });

        self.frame.clear();
        JpegEncoder::new_with_quality(&mut self.frame, 80)
            .encode_image(&image)
            .map_err(|e| SourceError::Device(format!("test pattern encode failed: {e}")))?;
        self.sequence += 1;
        Ok(())
    }
}

impl FrameSource for TestPatternSource {
    fn start_streaming(&mut self) -> Result<(), SourceError> {
        self.streaming = true;
        self.next_frame = Instant::now();
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), SourceError> {
        self.streaming = false;
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        if !self.streaming {
            return Err(SourceError::Device("stream not started".into()));
        }

        let due = self.next_frame.saturating_duration_since(Instant::now());
        if due > timeout {
            thread::sleep(timeout);
            return Err(SourceError::Timeout);
        }
        thread::sleep(due);

        // Don't try to catch up on frames missed while nobody was reading.
        self.next_frame = (self.next_frame + self.interval).max(Instant::now());
        self.render()
    }

    fn read_frame(&mut self) -> Result<&[u8], SourceError> {
        Ok(&self.frame)
    }
}
