//! Command-line interface definitions using clap.

use crate::analysis::{AnalysisSpec, AnalyzerKind};
use crate::config::{PoolConfig, secs_to_duration};
use crate::error::Result;
use crate::logging::{LogConfig, LogFormat, LogRotation};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Inspect camera frames with a dynamically sized pool of helper processes.
#[derive(Parser, Debug)]
#[command(name = "visionpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Rotation for --log-file (hourly, daily, never).
    #[arg(long, value_enum, default_value = "never", global = true)]
    pub log_rotation: LogRotation,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the inspection loop against synthetic cameras.
    Run(RunArgs),

    /// Serve analysis requests over stdin/stdout (spawned by the pool).
    #[command(hide = true)]
    Helper(HelperArgs),
}

/// How helpers are hosted.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// One OS process per helper.
    #[default]
    Process,
    /// One thread per helper, inside this process.
    Thread,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of inspection cycles (0 runs until Ctrl-C).
    #[arg(short = 'n', long, default_value_t = 10)]
    pub cycles: u64,

    /// Number of cameras, i.e. frames per batch.
    #[arg(short, long, default_value_t = 4)]
    pub cameras: usize,

    /// Frame width in pixels.
    #[arg(long, default_value_t = 64)]
    pub width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = 48)]
    pub height: u32,

    /// Workers started up front.
    #[arg(short, long, env = "VISIONPOOL_WORKERS")]
    pub workers: Option<usize>,

    /// Seconds a worker may sit idle before it exits.
    #[arg(long, env = "VISIONPOOL_HELPER_TIMEOUT", default_value_t = 30.0)]
    pub helper_timeout: f64,

    /// Seconds to wait for a batch before abandoning it.
    #[arg(long, env = "VISIONPOOL_DEADLINE", default_value_t = 60.0)]
    pub deadline: f64,

    /// Polling interval in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub poll_ms: u64,

    /// Analyzer run by every helper.
    #[arg(short, long, value_enum, default_value_t = AnalyzerKind::Reverse)]
    pub analyzer: AnalyzerKind,

    /// Cut-off for the threshold analyzer.
    #[arg(long, default_value_t = 128)]
    pub threshold: u8,

    /// Artificial per-frame analysis latency in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Make every n-th frame request fail (0 disables).
    #[arg(long, default_value_t = 0)]
    pub fail_every: u64,

    /// Where helpers run.
    #[arg(long, value_enum, default_value_t = Backend::Process)]
    pub backend: Backend,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Build and validate the pool configuration.
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let workers = self.workers.unwrap_or(self.cameras);
        let config = PoolConfig::new(self.helper_timeout, workers)?
            .with_poll_interval(Duration::from_millis(self.poll_ms))
            .with_collect_deadline(secs_to_duration("deadline", self.deadline)?);
        config.validate()?;
        Ok(config)
    }

    pub fn analysis(&self) -> AnalysisSpec {
        AnalysisSpec::new(self.analyzer)
            .with_threshold(self.threshold)
            .with_delay(Duration::from_millis(self.delay_ms))
    }

    /// `None` when the run should continue until interrupted.
    pub fn cycle_limit(&self) -> Option<u64> {
        (self.cycles > 0).then_some(self.cycles)
    }
}

/// Arguments for the hidden helper command.
#[derive(Parser, Debug)]
pub struct HelperArgs {
    #[arg(long, value_enum, default_value_t = AnalyzerKind::Reverse)]
    pub analyzer: AnalyzerKind,

    #[arg(long, default_value_t = 128)]
    pub threshold: u8,

    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Worker this helper serves, for log correlation.
    #[arg(long, default_value_t = 0)]
    pub worker_id: usize,
}

impl HelperArgs {
    pub fn analysis(&self) -> AnalysisSpec {
        AnalysisSpec::new(self.analyzer)
            .with_threshold(self.threshold)
            .with_delay(Duration::from_millis(self.delay_ms))
    }
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and errors.
    Normal,
    /// -v: include pool lifecycle info.
    Info,
    /// -vv: include per-batch debug info.
    Debug,
    /// -vvv: include per-item tracing.
    Trace,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl Verbosity {
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v/-q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }

    /// Logging configuration: CLI flags first, then environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = match self.command {
            Commands::Helper(_) => LogConfig::helper(),
            Commands::Run(_) => LogConfig::controller(),
        };
        if self.quiet || self.verbose > 0 {
            let level = self.verbosity().level();
            config = config.with_filter(level.to_string().to_lowercase());
        }
        config = config.with_env_overrides();
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone(), self.log_rotation);
        }
        config
    }
}
