//! Frame buffers passed between the capture, encode and broadcast stages.
//!
//! Both frame types wrap `bytes::Bytes`, so cloning one is a reference count
//! bump rather than a copy of the image data.

use bytes::Bytes;

/// Bytes exactly as the capture device produced them for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    data: Bytes,
}

impl RawFrame {
    /// Copy a device buffer into an owned frame.
    ///
    /// The device may overwrite its buffer as soon as control returns to it,
    /// so raw frames never alias device memory.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// JPEG-encoded frame ready to be served.
///
/// Every consumer of one broadcast round holds a clone of the same
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    jpeg: Bytes,
}

impl EncodedFrame {
    pub fn new(jpeg: impl Into<Bytes>) -> Self {
        Self { jpeg: jpeg.into() }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.jpeg
    }

    pub fn into_bytes(self) -> Bytes {
        self.jpeg
    }

    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    /// Whether two frames share the same underlying buffer.
    pub fn shares_buffer(&self, other: &EncodedFrame) -> bool {
        self.jpeg.as_ptr() == other.jpeg.as_ptr() && self.jpeg.len() == other.jpeg.len()
    }
}
