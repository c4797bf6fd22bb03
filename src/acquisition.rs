//! Frame sources feeding the inspection loop.
//!
//! Real camera drivers live outside this crate; they only need to implement
//! [`FrameSource`]. [`SyntheticCameras`] produces deterministic test patterns
//! so the pipeline can run without hardware.

use crate::frame::Frame;

/// A set of cameras that can be asked for one frame each.
pub trait FrameSource {
    /// Number of cameras this source exposes.
    fn camera_count(&self) -> usize;

    /// Request the next frame from `camera`.
    ///
    /// Returns `None` when the camera could not deliver a frame.
    fn request_frame(&mut self, camera: usize) -> Option<Frame>;
}

/// Deterministic multi-camera test-pattern generator.
#[derive(Debug, Clone)]
pub struct SyntheticCameras {
    cameras: usize,
    width: u32,
    height: u32,
    /// Every n-th request fails (0 disables failure injection).
    fail_every: u64,
    requests: u64,
}

impl SyntheticCameras {
    pub fn new(cameras: usize, width: u32, height: u32) -> Self {
        Self {
            cameras,
            width,
            height,
            fail_every: 0,
            requests: 0,
        }
    }

    /// Make every `n`-th frame request fail.
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    /// Total frame requests served so far, failed ones included.
    pub fn requests(&self) -> u64 {
        self.requests
    }
}

impl FrameSource for SyntheticCameras {
    fn camera_count(&self) -> usize {
        self.cameras
    }

    fn request_frame(&mut self, camera: usize) -> Option<Frame> {
        if camera >= self.cameras {
            return None;
        }
        self.requests += 1;
        if self.fail_every > 0 && self.requests % self.fail_every == 0 {
            tracing::debug!(camera, request = self.requests, "Injected acquisition failure");
            return None;
        }

        // Diagonal RGB gradient, offset per camera and per request.
        let shift = (camera as u64 * 37 + self.requests) as u32;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = x.wrapping_add(y).wrapping_add(shift);
                data.push((v & 0xff) as u8);
                data.push((v.wrapping_mul(3) & 0xff) as u8);
                data.push((v.wrapping_mul(7) & 0xff) as u8);
            }
        }
        Some(Frame {
            width: self.width,
            height: self.height,
            channels: 3,
            data,
        })
    }
}
