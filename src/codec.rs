//! Raw frame -> JPEG conversion

use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

use crate::frame::{EncodedFrame, RawFrame};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to decode raw frame: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

/// Turns one raw capture into a ready-to-serve JPEG.
///
/// Implementations must be deterministic; they run on blocking threads.
pub trait FrameCodec: Send + Sync {
    fn transcode(&self, raw: &RawFrame) -> Result<EncodedFrame, CodecError>;
}

/// Decodes whatever the camera produced and re-encodes it as baseline JPEG.
#[derive(Debug, Clone, Copy)]
pub struct JpegTranscoder {
    quality: u8,
}

impl JpegTranscoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegTranscoder {
    fn default() -> Self {
        Self::new(75)
    }
}

impl FrameCodec for JpegTranscoder {
    fn transcode(&self, raw: &RawFrame) -> Result<EncodedFrame, CodecError> {
        let image = image::load_from_memory(raw.as_bytes()).map_err(CodecError::Decode)?;
        // JPEG has no alpha channel
        let rgb = image.to_rgb8();

        let mut jpeg = Vec::with_capacity(raw.len());
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&rgb)
            .map_err(CodecError::Encode)?;

        Ok(EncodedFrame::new(jpeg))
    }
}
