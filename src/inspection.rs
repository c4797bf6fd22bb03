//! The inspection loop: acquire, dispatch, preview, collect.
//!
//! One cycle requests a frame from every camera, sends the set to the pool
//! as one batch, pushes the first frame to the preview and waits for the
//! analyzed frames. The loop runs until the requested number of cycles is
//! done or a stop is requested.

use crate::acquisition::FrameSource;
use crate::error::{PoolError, Result};
use crate::frame::Frame;
use crate::pool::Dispatcher;
use crate::progress::ProgressSink;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Options for [`run_inspection`].
#[derive(Debug, Clone, Default)]
pub struct InspectionOptions {
    /// Stop after this many cycles; `None` runs until a stop is requested.
    pub cycles: Option<u64>,
    /// Camera whose frame goes to the live preview.
    pub preview_camera: usize,
}

/// What happened over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InspectionSummary {
    /// Cycles whose batch was collected in full.
    pub cycles_completed: u64,
    /// Cycles skipped because a camera failed to deliver.
    pub cycles_skipped: u64,
    /// Cycles abandoned because the results did not arrive in time.
    pub cycles_timed_out: u64,
    pub frames_analyzed: u64,
    /// Total payload size of all analyzed frames.
    pub bytes_out: u64,
    /// Whether the run ended because of a stop request.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// Drive `dispatcher` with frames from `source`.
///
/// Acquisition failures skip the cycle; a collection timeout abandons the
/// cycle and the loop carries on. A stop request ends the run cleanly. Any
/// other error is returned.
#[instrument(level = "debug", skip_all)]
pub fn run_inspection<S: FrameSource>(
    dispatcher: &mut Dispatcher,
    source: &mut S,
    progress: &ProgressSink,
    options: &InspectionOptions,
) -> Result<InspectionSummary> {
    let start = Instant::now();
    let shared = dispatcher.shared();
    let mut summary = InspectionSummary::default();
    let mut cycle = 0u64;

    loop {
        if options.cycles.is_some_and(|limit| cycle >= limit) {
            break;
        }
        if !shared.is_running() {
            summary.cancelled = true;
            break;
        }
        cycle += 1;

        let Some(frames) = acquire(source, cycle) else {
            summary.cycles_skipped += 1;
            continue;
        };
        let preview = frames.get(options.preview_camera).cloned();

        match dispatcher.send_batch(frames) {
            Ok(_) => {}
            Err(PoolError::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Err(e) => return Err(e),
        }
        if let Some(frame) = preview {
            progress.preview(options.preview_camera, frame);
        }

        match dispatcher.collect_batch() {
            Ok(results) => {
                summary.cycles_completed += 1;
                summary.frames_analyzed += results.len() as u64;
                summary.bytes_out += results.iter().map(|f| f.data.len() as u64).sum::<u64>();
                debug!(cycle, frames = results.len(), "Cycle complete");
            }
            Err(PoolError::DispatchTimeout { pending, waited }) => {
                summary.cycles_timed_out += 1;
                warn!(cycle, pending, waited_ms = waited.as_millis() as u64, "Cycle timed out");
            }
            Err(PoolError::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    summary.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        completed = summary.cycles_completed,
        skipped = summary.cycles_skipped,
        timed_out = summary.cycles_timed_out,
        cancelled = summary.cancelled,
        "Inspection finished"
    );
    Ok(summary)
}

/// One frame per camera, or `None` if any camera failed.
fn acquire<S: FrameSource>(source: &mut S, cycle: u64) -> Option<Vec<Frame>> {
    let mut frames = Vec::with_capacity(source.camera_count());
    for camera in 0..source.camera_count() {
        match source.request_frame(camera) {
            Some(frame) => frames.push(frame),
            None => {
                warn!(cycle, camera, "Camera failed to deliver a frame; skipping cycle");
                return None;
            }
        }
    }
    Some(frames)
}
