//! IPC protocol between a worker and its helper subprocess.
//!
//! Messages are JSON-serialized and newline-delimited.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};

/// Request from worker to helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HelperRequest {
    /// Analyze one tagged frame.
    #[serde(rename = "analyze")]
    Analyze {
        batch: u64,
        sequence_id: usize,
        frame: Frame,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from helper to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HelperResponse {
    /// Helper finished initializing its analyzer.
    #[serde(rename = "ready")]
    Ready,

    /// Successful analysis.
    #[serde(rename = "result")]
    Result {
        batch: u64,
        sequence_id: usize,
        frame: Frame,
    },

    /// Analysis failed.
    #[serde(rename = "error")]
    Error {
        batch: u64,
        sequence_id: usize,
        message: String,
    },
}

impl HelperRequest {
    pub fn analyze(batch: u64, sequence_id: usize, frame: Frame) -> Self {
        Self::Analyze {
            batch,
            sequence_id,
            frame,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl HelperResponse {
    pub fn result(batch: u64, sequence_id: usize, frame: Frame) -> Self {
        Self::Result {
            batch,
            sequence_id,
            frame,
        }
    }

    pub fn error(batch: u64, sequence_id: usize, message: impl Into<String>) -> Self {
        Self::Error {
            batch,
            sequence_id,
            message: message.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
