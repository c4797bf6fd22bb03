//! Dynamic helper pool for per-camera frame analysis.
//!
//! A dispatcher hands one work item per captured frame to a variable-size
//! pool of workers. Each worker drives its own helper (normally a separate
//! process running `visionpool helper`), and results come back in whatever
//! order the helpers finish; the dispatcher puts them back in input order.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────┐
//!                    │    Dispatcher    │  send_batch / collect_batch
//!                    └───┬──────────▲───┘
//!              input     │          │     output
//!              queue     │          │     queue
//!               ┌────────┼──────────┼────────┐
//!               │        │          │        │
//!         ┌─────▼─────┐  ┌▼─────────┴┐  ┌────▼──────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │  spawned on demand by
//!         │ (thread)  │  │ (thread)  │  │ (thread)  │  the PoolManager
//!         └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!               │ stdin/stdout │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Helper 1  │  │ Helper 2  │  │ Helper N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Spawn on demand**: a batch of `n` items spawns exactly enough
//!   workers to have `n` idle
//! - **Idle retirement**: workers exit after the helper timeout with
//!   nothing to do
//! - **Ordered results**: out-of-order completion is undone by sequence id
//! - **Coordinated shutdown**: graceful (finish the item in hand) or forced
//!   (kill helpers within one polling interval)

mod dispatcher;
mod helper;
pub mod helper_main;
mod ipc;
mod local;
mod manager;
mod proc;
mod protocol;
mod shared;
mod signals;
mod spawn;
mod worker;

pub use dispatcher::Dispatcher;
pub use helper::{Helper, HelperLauncher};
pub use helper_main::run_helper_main;
pub use local::{ThreadHelper, ThreadLauncher};
pub use manager::{PoolManager, ShutdownReport};
pub use protocol::{HelperRequest, HelperResponse};
pub use shared::{
    CensusCounts, ProgressCounters, ResultItem, SharedState, StopMode, Termination, TrafficPause,
    WorkItem, WorkerCensus,
};
pub use signals::TerminationReason;
pub use spawn::{ProcessHelper, ProcessLauncher};
pub use worker::{ExitReason, WorkerExit, WorkerState, WorkerTimings};
