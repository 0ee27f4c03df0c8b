use thiserror::Error;

use crate::capture::CaptureError;
use crate::codec::CodecError;
use crate::timelapse::TimelapseError;

/// Fatal error reported by a pipeline worker.
#[derive(Error, Debug)]
pub enum Error {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("frame encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("timelapse failed: {0}")]
    Timelapse(#[from] TimelapseError),

    #[error("http server failed: {0}")]
    Http(#[source] std::io::Error),

    #[error("worker {0} panicked")]
    Panicked(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
