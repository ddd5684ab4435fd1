use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use relive_engine::{
    Broadcast, CaptureConfig, CaptureSession, CaptureTermination, FfmpegConcatenator, Manifest,
    MergeSettings, SessionError, merge,
};

// Exit codes beyond success/failure so scripts can tell why a run ended.
const EXIT_RESOLUTION: u8 = 2;
const EXIT_REWIND_EXHAUSTED: u8 = 3;
const EXIT_CANCELLED: u8 = 4;
const EXIT_MERGE_INTEGRITY: u8 = 5;

#[derive(Parser)]
#[command(
    name = "relive",
    about = "Capture an in-progress live broadcast from its start and merge it into one file",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a broadcast, rewind to its oldest retrievable segment,
    /// capture everything up to the stream end and merge the result
    Capture(CaptureArgs),

    /// Merge an already-captured segment directory without a live session
    Merge(MergeArgs),
}

#[derive(ClapArgs)]
struct CaptureArgs {
    /// Broadcast reference (metadata document URL)
    broadcast: String,

    /// Directory for segment files, the manifest and the merged output
    #[arg(short, long, default_value = "capture")]
    output_dir: PathBuf,

    /// Skip rewinding and start from this sequence number
    #[arg(long)]
    start_sequence: Option<u64>,

    /// Concurrent segment downloads
    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    /// How far back to rewind, in seconds
    #[arg(long, default_value_t = 4 * 3600)]
    rewind_window_secs: u64,

    /// Quality/format selector forwarded to the segment endpoint
    #[arg(long)]
    quality: Option<String>,

    /// Override the advertised per-segment duration, in seconds
    #[arg(long)]
    segment_duration_secs: Option<f64>,

    /// File name of the merged output, inside the output directory
    #[arg(long, default_value = "recording.ts")]
    output_file: String,

    /// Delete the individual segment files after a validated merge
    #[arg(long)]
    remove_segments: bool,
}

#[derive(ClapArgs)]
struct MergeArgs {
    /// Directory of previously captured segment files
    dir: PathBuf,

    /// Path of the merged output file
    #[arg(short, long)]
    output: PathBuf,

    /// Per-segment duration used for duration validation, in seconds
    #[arg(long, default_value_t = 5.0)]
    segment_duration_secs: f64,

    /// Delete the individual segment files after a validated merge
    #[arg(long)]
    remove_segments: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match args.command {
        Commands::Capture(capture_args) => run_capture(capture_args).await,
        Commands::Merge(merge_args) => run_merge(merge_args).await,
    }
}

async fn run_capture(args: CaptureArgs) -> ExitCode {
    let mut config = CaptureConfig {
        max_concurrency: args.concurrency,
        rewind_window: Duration::from_secs(args.rewind_window_secs),
        start_sequence: args.start_sequence,
        output_file_name: args.output_file,
        remove_segments_after_merge: args.remove_segments,
        ..Default::default()
    };
    if let Some(secs) = args.segment_duration_secs {
        if secs <= 0.0 || !secs.is_finite() {
            error!(secs, "Segment duration override must be positive");
            return ExitCode::FAILURE;
        }
        config.segment_duration_override = Some(Duration::from_secs_f64(secs));
    }

    let broadcast = Broadcast {
        reference: args.broadcast,
        quality: args.quality,
        auth: None,
    };

    let mut session = match CaptureSession::new(broadcast, config) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to initialize session");
            return ExitCode::FAILURE;
        }
    };

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight segments and merging");
            token.cancel();
        }
    });

    let outcome = match session.run(&args.output_dir).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Capture failed");
            return match e {
                SessionError::Resolution(_) => ExitCode::from(EXIT_RESOLUTION),
                SessionError::Rewind(_) => ExitCode::from(EXIT_REWIND_EXHAUSTED),
                _ => ExitCode::FAILURE,
            };
        }
    };

    info!(
        downloaded = outcome.summary.downloaded,
        missing = outcome.summary.missing,
        floor = outcome.summary.floor,
        "Capture finished"
    );
    let mut exit = match outcome.termination {
        CaptureTermination::Completed => ExitCode::SUCCESS,
        CaptureTermination::Cancelled => ExitCode::from(EXIT_CANCELLED),
    };

    if let Some(report) = &outcome.merge {
        if let Some(e) = report.integrity_error() {
            error!(error = %e, "Merged artifact failed validation");
            exit = ExitCode::from(EXIT_MERGE_INTEGRITY);
        }
    } else {
        warn!("No segments were captured; nothing to merge");
    }
    exit
}

async fn run_merge(args: MergeArgs) -> ExitCode {
    if args.segment_duration_secs <= 0.0 || !args.segment_duration_secs.is_finite() {
        error!(
            secs = args.segment_duration_secs,
            "Segment duration must be positive"
        );
        return ExitCode::FAILURE;
    }
    let settings = MergeSettings {
        segment_duration: Duration::from_secs_f64(args.segment_duration_secs),
        duration_tolerance: CaptureConfig::default().duration_tolerance,
        remove_segments: args.remove_segments,
    };

    match Manifest::load_summary(&args.dir) {
        Ok(summary) => info!(
            floor = summary.floor,
            downloaded = summary.downloaded,
            missing = summary.missing,
            "Found capture summary"
        ),
        Err(_) => warn!("No capture summary found; reconstructing the plan from segment files"),
    }

    let concatenator = FfmpegConcatenator::default();
    match merge::merge_directory(&args.dir, &concatenator, &settings, &args.output).await {
        Ok(report) => {
            if let Some(e) = report.integrity_error() {
                error!(error = %e, "Merged artifact failed validation");
                return ExitCode::from(EXIT_MERGE_INTEGRITY);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Merge failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("relive=debug,relive_engine=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
