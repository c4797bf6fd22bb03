//! One-way progress channel from the pool to the user interface.
//!
//! Workers and the dispatcher push [`ProgressEvent`]s; nothing is ever read
//! back. [`ProgressReporter`] renders the stream as a terminal progress bar.

use crate::frame::Frame;
use crossbeam_channel::{Receiver, Sender, unbounded};
use indicatif::{ProgressBar, ProgressStyle};
use std::thread::{self, JoinHandle};

/// Events published to the interface.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A batch of `size` items was dispatched.
    BatchStarted { batch: u64, size: usize },
    /// `delta` more items finished processing.
    Advanced { delta: u64 },
    /// Results still outstanding for the current batch.
    Remaining { count: usize },
    /// Raw frame for the live preview.
    Preview { camera: usize, frame: Frame },
}

/// Sending half of the progress channel.
///
/// Cloning is cheap. Sends never block and never fail: if nobody listens,
/// events are dropped.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<Sender<ProgressEvent>>,
}

impl ProgressSink {
    /// Create a connected sink and its receiving end.
    pub fn channel() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn batch_started(&self, batch: u64, size: usize) {
        self.emit(ProgressEvent::BatchStarted { batch, size });
    }

    pub fn advanced(&self, delta: u64) {
        self.emit(ProgressEvent::Advanced { delta });
    }

    pub fn remaining(&self, count: usize) {
        self.emit(ProgressEvent::Remaining { count });
    }

    pub fn preview(&self, camera: usize, frame: Frame) {
        self.emit(ProgressEvent::Preview { camera, frame });
    }
}

/// Totals accumulated by a reporter over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTotals {
    pub batches: u64,
    pub processed: u64,
    pub previews: u64,
}

/// Background thread that renders progress events.
pub struct ProgressReporter {
    handle: JoinHandle<ProgressTotals>,
}

impl ProgressReporter {
    /// Start consuming `rx`. The thread ends when every sink is dropped.
    pub fn spawn(rx: Receiver<ProgressEvent>, show_bar: bool) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("progress-reporter".to_string())
            .spawn(move || render(rx, show_bar))?;
        Ok(Self { handle })
    }

    /// Wait for the channel to drain and return the totals.
    pub fn finish(self) -> ProgressTotals {
        self.handle.join().unwrap_or_default()
    }
}

fn render(rx: Receiver<ProgressEvent>, show_bar: bool) -> ProgressTotals {
    let bar = if show_bar {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} batch {prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut totals = ProgressTotals::default();
    for event in rx {
        match event {
            ProgressEvent::BatchStarted { batch, size } => {
                totals.batches += 1;
                bar.reset();
                bar.set_length(size as u64);
                bar.set_prefix(batch.to_string());
            }
            ProgressEvent::Advanced { delta } => {
                totals.processed += delta;
                bar.inc(delta);
            }
            ProgressEvent::Remaining { count } => {
                bar.set_message(format!("{} pending", count));
            }
            ProgressEvent::Preview { camera, frame } => {
                totals.previews += 1;
                tracing::trace!(
                    camera,
                    width = frame.width,
                    height = frame.height,
                    "Preview frame"
                );
            }
        }
    }
    bar.finish_and_clear();
    totals
}
