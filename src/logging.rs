//! Tracing setup for the controller and for helper processes.
//!
//! Both roles log to stderr. A helper's stdout is the protocol channel, so
//! nothing but protocol lines may ever reach it, and helpers never open log
//! files: they inherit the controller's environment, and several helpers
//! appending to one rolling file would interleave mid-line.
//!
//! # Environment Variables
//!
//! - `VISIONPOOL_LOG` - filter directives (takes precedence over `RUST_LOG`)
//! - `VISIONPOOL_LOG_LEVEL` - level used when no filter is set
//! - `VISIONPOOL_LOG_FORMAT` - pretty, compact or json
//! - `VISIONPOOL_LOG_FILE` - extra file output (controller only)
//!
//! ```no_run
//! use visionpool::logging::{LogConfig, init};
//!
//! init(LogConfig::helper().with_env_overrides());
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing::Level;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Which end of the helper pipe this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    /// `visionpool run`: the dispatcher and the pool.
    Controller,
    /// `visionpool helper`: one analysis subprocess.
    Helper,
}

/// Line format shared by stderr and file output.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    #[value(alias = "full")]
    Pretty,
    Compact,
    Json,
}

/// When the log file rolls over.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Where the controller mirrors its log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub rotation: LogRotation,
}

/// Logging configuration for one process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub role: LogRole,
    /// Used when `filter` is unset.
    pub level: Level,
    /// `EnvFilter` directives, e.g. `visionpool::pool=debug`.
    pub filter: Option<String>,
    pub format: LogFormat,
    /// Always `None` for helpers.
    pub file: Option<LogFile>,
}

impl LogConfig {
    /// Warnings and errors, human-readable.
    pub fn controller() -> Self {
        Self {
            role: LogRole::Controller,
            level: Level::WARN,
            filter: None,
            format: LogFormat::Pretty,
            file: None,
        }
    }

    /// Warnings and errors on one line each, so output from many helpers
    /// sharing the controller's stderr stays readable.
    pub fn helper() -> Self {
        Self {
            role: LogRole::Helper,
            format: LogFormat::Compact,
            ..Self::controller()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Mirror output into `path`. Ignored for helpers.
    pub fn with_file(mut self, path: PathBuf, rotation: LogRotation) -> Self {
        if self.role == LogRole::Controller {
            self.file = Some(LogFile { path, rotation });
        }
        self
    }

    /// Fill in whatever the command line left unset from `VISIONPOOL_*`
    /// (and `RUST_LOG`). Format and file from the environment replace the
    /// preset; callers apply explicit flags afterwards.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = env_var("VISIONPOOL_LOG").or_else(|| env_var("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = env_var("VISIONPOOL_LOG_LEVEL").and_then(|l| l.parse().ok())
        {
            self.level = level;
        }
        if let Some(format) =
            env_var("VISIONPOOL_LOG_FORMAT").and_then(|f| LogFormat::from_str(&f, true).ok())
        {
            self.format = format;
        }
        if let Some(path) = env_var("VISIONPOOL_LOG_FILE") {
            let rotation = self.file.as_ref().map_or(LogRotation::Never, |f| f.rotation);
            self = self.with_file(PathBuf::from(path), rotation);
        }
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
                eprintln!("Warning: ignoring log filter '{}': {}", directives, e);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn open_file(&self) -> Option<Result<RollingFileAppender, InitError>> {
        let file = self.file.as_ref()?;
        let dir = match file.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => std::path::Path::new("."),
        };
        let name = file
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("visionpool.log");
        Some(
            RollingFileAppender::builder()
                .rotation(file.rotation.into())
                .filename_prefix(name)
                .build(dir),
        )
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    match format {
        LogFormat::Pretty => layer.boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global subscriber. Later calls are no-ops.
///
/// A log file that cannot be opened is reported once and skipped; the
/// process keeps logging to stderr.
pub fn init(config: LogConfig) {
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(
        config.format,
        std::io::stderr,
        std::io::stderr().is_terminal(),
    )];

    match config.open_file() {
        Some(Ok(appender)) => layers.push(fmt_layer(config.format, appender, false)),
        Some(Err(e)) => eprintln!("Warning: cannot open log file, logging to stderr only: {}", e),
        None => {}
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter())
        .try_init();
}
