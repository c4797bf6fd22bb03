//! Raw image frames exchanged between cameras, the dispatcher and helpers.

use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};

/// An uncompressed, interleaved 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Interleaved channels per pixel (1 = gray, 3 = RGB).
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame, checking that `data` matches the dimensions.
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        let frame = Self {
            width,
            height,
            channels,
            data,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Create a frame with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        let len = width as usize * height as usize * channels as usize;
        Self {
            width,
            height,
            channels,
            data: vec![value; len],
        }
    }

    /// Number of bytes the dimensions call for.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// Check that the buffer length matches the dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(PoolError::InvalidFrame("frame has zero channels".into()));
        }
        if self.data.len() != self.expected_len() {
            return Err(PoolError::InvalidFrame(format!(
                "{}x{}x{} frame carries {} bytes, expected {}",
                self.width,
                self.height,
                self.channels,
                self.data.len(),
                self.expected_len()
            )));
        }
        Ok(())
    }

    /// Pixel count (width * height).
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
