//! Built-in frame analyzers run inside helpers.
//!
//! The pool treats analysis as an opaque `Frame -> Frame` transform. Each
//! helper rebuilds its analyzer from an [`AnalysisSpec`], so no analyzer
//! state is ever shared across process boundaries.

use crate::error::{PoolError, Result};
use crate::frame::Frame;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A `Frame -> Frame` image transform.
pub trait Analyzer: Send {
    fn analyze(&mut self, frame: Frame) -> Result<Frame>;
}

impl<F> Analyzer for F
where
    F: FnMut(Frame) -> Result<Frame> + Send,
{
    fn analyze(&mut self, frame: Frame) -> Result<Frame> {
        self(frame)
    }
}

/// Selectable analyzer kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    /// Return the frame unchanged.
    Identity,
    /// Reverse the raw byte buffer.
    #[default]
    Reverse,
    /// Invert every byte (255 - v).
    Invert,
    /// Collapse RGB to a single luma channel.
    Grayscale,
    /// Binarize each byte against a threshold.
    Threshold,
}

impl std::fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Reverse => "reverse",
            Self::Invert => "invert",
            Self::Grayscale => "grayscale",
            Self::Threshold => "threshold",
        };
        f.write_str(name)
    }
}

/// Everything a helper needs to rebuild its analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSpec {
    pub kind: AnalyzerKind,
    /// Cut-off used by [`AnalyzerKind::Threshold`].
    pub threshold: u8,
    /// Artificial per-frame latency, to emulate an expensive vision pass.
    pub delay: Duration,
}

impl Default for AnalysisSpec {
    fn default() -> Self {
        Self {
            kind: AnalyzerKind::default(),
            threshold: 128,
            delay: Duration::ZERO,
        }
    }
}

impl AnalysisSpec {
    pub fn new(kind: AnalyzerKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    /// Instantiate a fresh analyzer for this spec.
    pub fn build(&self) -> BuiltinAnalyzer {
        BuiltinAnalyzer { spec: self.clone() }
    }
}

/// Analyzer backed by one of the [`AnalyzerKind`] transforms.
#[derive(Debug, Clone)]
pub struct BuiltinAnalyzer {
    spec: AnalysisSpec,
}

impl Analyzer for BuiltinAnalyzer {
    fn analyze(&mut self, frame: Frame) -> Result<Frame> {
        frame.validate()?;
        if !self.spec.delay.is_zero() {
            std::thread::sleep(self.spec.delay);
        }
        match self.spec.kind {
            AnalyzerKind::Identity => Ok(frame),
            AnalyzerKind::Reverse => Ok(reverse(frame)),
            AnalyzerKind::Invert => Ok(invert(frame)),
            AnalyzerKind::Grayscale => grayscale(frame),
            AnalyzerKind::Threshold => Ok(threshold(frame, self.spec.threshold)),
        }
    }
}

fn reverse(mut frame: Frame) -> Frame {
    frame.data.reverse();
    frame
}

fn invert(mut frame: Frame) -> Frame {
    for byte in &mut frame.data {
        *byte = 255 - *byte;
    }
    frame
}

fn threshold(mut frame: Frame, cutoff: u8) -> Frame {
    for byte in &mut frame.data {
        *byte = if *byte > cutoff { 255 } else { 0 };
    }
    frame
}

/// ITU-R BT.601 luma, integer approximation.
fn grayscale(frame: Frame) -> Result<Frame> {
    match frame.channels {
        1 => Ok(frame),
        3 => {
            let data = frame
                .data
                .chunks_exact(3)
                .map(|px| {
                    let luma = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                    (luma / 1000) as u8
                })
                .collect();
            Ok(Frame {
                width: frame.width,
                height: frame.height,
                channels: 1,
                data,
            })
        }
        n => Err(PoolError::InvalidFrame(format!(
            "grayscale expects 1 or 3 channels, got {}",
            n
        ))),
    }
}
