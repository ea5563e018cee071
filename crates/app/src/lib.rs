use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use synclip_core::backend::ComputeDevice;
use synclip_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use synclip_core::detect::OrtFaceDetector;
use synclip_core::inference::OrtLipSyncModel;
use synclip_core::logging::{self, LoggingOptions};
use synclip_core::pipeline::Pipeline;
use synclip_core::types::Frame;

pub mod io;

#[derive(Parser)]
#[command(name = "synclip", about = "Audio-driven lip-sync frame synthesis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory (config, logs)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize a lip-synced frame sequence from audio features and frames
    Run(RunArgs),
    /// Create the data directory with a default config.toml
    Init,
}

#[derive(Args)]
struct RunArgs {
    #[arg(
        long,
        help = "Audio feature map: raw little-endian f32 file with a .json shape sidecar"
    )]
    features: PathBuf,

    #[arg(
        short = 'i',
        long = "frame",
        value_name = "PPM",
        required = true,
        help = "Source frame (binary PPM); repeat in order for moving footage"
    )]
    frames: Vec<PathBuf>,

    #[arg(short = 'o', long, help = "Output directory (default: <config output_dir>)")]
    output: Option<PathBuf>,

    #[arg(long, help = "Force CPU inference regardless of config")]
    cpu: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let _log_guard = init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    match cli.command {
        Commands::Run(args) => run_synthesis(args, &resolved_data_dir).await,
        Commands::Init => {
            initialize_data_dir(&resolved_data_dir)?;
            info!(
                data_dir = %resolved_data_dir.display(),
                "data directory initialized"
            );
            Ok(())
        }
    }
}

fn init_logging(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
    };
    let filter = logging::select_log_filter(&options);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(&filter));

    let (file_layer, guard) = match data_dir.map(logging::build_file_appender) {
        Some(Ok((appender, _log_dir))) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&filter));
            (Some(layer), Some(guard))
        }
        Some(Err(error)) => {
            eprintln!("Warning: file logging unavailable: {error:#}");
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

async fn run_synthesis(args: RunArgs, resolved_data_dir: &Path) -> Result<()> {
    let started = Instant::now();
    initialize_data_dir(resolved_data_dir)?;
    let config = AppConfig::load_from_path(&config_path(resolved_data_dir))?;

    let mut pipeline_config = config.pipeline.clone();
    if args.cpu {
        pipeline_config.device = ComputeDevice::Cpu;
    }

    let feature_map = io::read_feature_map(&args.features)?;
    let frames: Vec<Frame> = args
        .frames
        .iter()
        .map(|path| io::read_ppm(path))
        .collect::<Result<_>>()?;
    if frames.is_empty() {
        bail!("at least one source frame is required");
    }
    info!(
        frames = frames.len(),
        feature_bins = feature_map.bins(),
        feature_steps = feature_map.steps(),
        device = %pipeline_config.device,
        "inputs loaded"
    );

    let models_dir = resolve_relative_to(resolved_data_dir, &config.paths.models_dir);
    let detector_path = resolve_relative_to(&models_dir, &config.paths.detector_model);
    let model_path = resolve_relative_to(&models_dir, &config.paths.lipsync_model);

    let detector = OrtFaceDetector::load(
        &detector_path,
        pipeline_config.device,
        pipeline_config.score_threshold,
    )
    .context("failed to load face-detection model")?;
    let model = OrtLipSyncModel::load(&model_path, pipeline_config.device)
        .context("failed to load lip-sync model")?;

    let pipeline = Pipeline::new(
        Arc::new(detector),
        Arc::new(model),
        pipeline_config.pipeline_options(),
    );
    let sequence = pipeline.run(&feature_map, frames, None).await?;

    let output_dir = args
        .output
        .unwrap_or_else(|| resolve_relative_to(resolved_data_dir, &config.paths.output_dir));
    let manifest = io::write_sequence(&output_dir, &sequence)?;

    info!(
        frames = manifest.frame_count,
        duration_secs = manifest.duration_secs,
        output = %output_dir.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "synthesis written"
    );

    if manifest.frame_count as f64 / manifest.fps > 60.0 {
        warn!("output exceeds a minute of video; muxing may be slow");
    }

    Ok(())
}
