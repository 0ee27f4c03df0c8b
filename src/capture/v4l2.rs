//! V4L2 frame source using memory-mapped buffers

use std::io;
use std::time::Duration;

use tracing::info;
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{FrameSource, SourceError};

const BUFFER_COUNT: u32 = 4;

/// Buffer held back from the driver at stream start. `next()` queues the
/// buffer it last handed out before dequeuing, and that starts as index 0.
const HELD_BUFFER: usize = 0;

pub struct V4l2Source {
    stream: MmapStream<'static>,
    _device: Device,
    /// Copy of the last dequeued buffer, `bytesused` long.
    frame: Vec<u8>,
}

impl V4l2Source {
    /// Open `path` and configure it for MJPEG at the requested size.
    pub fn open(path: &str, width: u32, height: u32) -> Result<Self, SourceError> {
        info!(device = %path, "Opening V4L2 capture device");

        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!(card = %caps.card, driver = %caps.driver, "Capture device opened");

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Device(format!(
                "{path} does not support video capture"
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = FourCC::new(b"MJPG");
        let fmt = device.set_format(&fmt)?;
        info!(format = %fmt, "Camera format set");

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;

        Ok(Self {
            stream,
            _device: device,
            frame: Vec::new(),
        })
    }
}

impl FrameSource for V4l2Source {
    fn start_streaming(&mut self) -> Result<(), SourceError> {
        for index in 0..BUFFER_COUNT as usize {
            if index != HELD_BUFFER {
                CaptureStream::queue(&mut self.stream, index)?;
            }
        }
        Stream::start(&mut self.stream)?;
        info!(buffers = BUFFER_COUNT, "Capture stream started");
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), SourceError> {
        Stream::stop(&mut self.stream)?;
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        // Poll before touching the queue. An expired wait leaves the stream
        // running and every queued buffer in place, so a frame that takes
        // longer than one wait still lands on a later one.
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        if self.stream.handle().poll(libc::POLLIN, millis)? == 0 {
            return Err(SourceError::Timeout);
        }

        self.stream.set_timeout(timeout);
        match CaptureStream::next(&mut self.stream) {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                self.frame.clear();
                self.frame.extend_from_slice(&buf[..used]);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(SourceError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn read_frame(&mut self) -> Result<&[u8], SourceError> {
        Ok(&self.frame)
    }
}
