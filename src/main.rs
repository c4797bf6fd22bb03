//! visionpool - camera frame inspection on a dynamic helper pool

use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde::Serialize;

use visionpool::acquisition::SyntheticCameras;
use visionpool::cli::{Backend, Cli, Commands, RunArgs};
use visionpool::inspection::{InspectionOptions, InspectionSummary, run_inspection};
use visionpool::logging;
use visionpool::pool::{
    Dispatcher, HelperLauncher, ProcessLauncher, StopMode, ThreadLauncher, run_helper_main,
};
use visionpool::progress::{ProgressReporter, ProgressSink};

/// Program entry point: parses CLI arguments, sets up logging, dispatches the
/// selected command, and handles top-level errors.
///
/// On error prints a colored error header followed by each cause in the error
/// chain before exiting with status code 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    logging::init(cli.log_config());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Helper(args) => run_helper_main(args.analysis(), args.worker_id),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Machine-readable result of `visionpool run --json`.
#[derive(Debug, Serialize)]
struct RunReport {
    #[serde(flatten)]
    summary: InspectionSummary,
    helpers: String,
    workers_spawned: usize,
    items_lost: usize,
    shutdown: String,
}

/// Runs the inspection loop until the cycle limit or Ctrl+C.
///
/// The first Ctrl+C lets helpers finish the frame in hand; a second one
/// kills them.
fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let config = args
        .pool_config()
        .context("Invalid pool configuration")?;
    let analysis = args.analysis();

    let launcher: Arc<dyn HelperLauncher> = match args.backend {
        Backend::Process => Arc::new(
            ProcessLauncher::current_exe(analysis)?.with_stop_timeout(config.helper_stop_timeout),
        ),
        Backend::Thread => Arc::new(
            ThreadLauncher::new(analysis).with_stop_timeout(config.helper_stop_timeout),
        ),
    };

    let (progress, events) = ProgressSink::channel();
    let show_bar = !cli.quiet && !args.json && std::io::stderr().is_terminal();
    let reporter =
        ProgressReporter::spawn(events, show_bar).context("Failed to start progress reporter")?;

    let mut dispatcher = Dispatcher::new(config, launcher, progress.clone())
        .context("Failed to start helper pool")?;

    // Set up Ctrl+C handler
    let shared = dispatcher.shared();
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nReceived Ctrl+C, finishing frames in progress (press again to abort)...");
            shared.request_stop(StopMode::Graceful);
        } else {
            eprintln!("\nReceived Ctrl+C again, aborting...");
            shared.request_stop(StopMode::Forced);
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut cameras = SyntheticCameras::new(args.cameras, args.width, args.height)
        .with_failure_every(args.fail_every);
    let options = InspectionOptions {
        cycles: args.cycle_limit(),
        preview_camera: 0,
    };
    let outcome = run_inspection(&mut dispatcher, &mut cameras, &progress, &options);

    let mode = dispatcher
        .shared()
        .stop_mode()
        .unwrap_or(StopMode::Graceful);
    let helpers = dispatcher.manager().describe();
    let shutdown = dispatcher.shutdown(mode);
    drop(dispatcher);
    drop(progress);
    let totals = reporter.finish();

    let summary = outcome.context("Inspection failed")?;

    if args.json {
        let report = RunReport {
            summary,
            helpers,
            workers_spawned: shutdown.workers(),
            items_lost: shutdown.items_lost(),
            shutdown: mode.to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !cli.quiet {
        eprintln!();
        if summary.cancelled {
            eprintln!("Inspection interrupted.");
        } else {
            eprintln!("Inspection complete!");
        }
        eprintln!("  Helpers: {}", helpers);
        eprintln!("  Cycles completed: {}", summary.cycles_completed);
        eprintln!("  Cycles skipped: {}", summary.cycles_skipped);
        eprintln!("  Cycles timed out: {}", summary.cycles_timed_out);
        eprintln!("  Frames analyzed: {}", summary.frames_analyzed);
        eprintln!("  Frames processed by helpers: {}", totals.processed);
        eprintln!("  Workers spawned: {}", shutdown.workers());
        if shutdown.items_lost() > 0 {
            eprintln!(
                "  {}: {}",
                "Frames lost".if_supports_color(Stderr, |text| text.yellow()),
                shutdown.items_lost()
            );
        }
        eprintln!("  Elapsed: {} ms", summary.elapsed_ms);
    }

    Ok(())
}
