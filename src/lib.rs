//! visionpool - camera frame inspection on a dynamic helper pool.
//!
//! The [`pool`] module is the core: a [`pool::Dispatcher`] sends one work
//! item per frame to a variable-size set of helpers and returns the analyzed
//! frames in input order. [`inspection`] drives it from a
//! [`acquisition::FrameSource`].

pub mod acquisition;
pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod inspection;
pub mod logging;
pub mod pool;
pub mod progress;

pub use error::{PoolError, Result};
