use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use uppscale_core::backend::{model_cache_dir, InferenceBackend};
use uppscale_core::compositor::SeamPolicy;
use uppscale_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use uppscale_core::image_io;
use uppscale_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use uppscale_core::types::{ProcessingProgress, ProcessingUpdate};
use uppscale_core::{ProcessingType, Processor, RunEvent, TileSize};

#[derive(Parser)]
#[command(name = "uppscale", about = "Tiled AI photo upscaling and light enhancement")]
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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enhance one image file.
    Process(ProcessArgs),
    /// List processing types and the model file each one loads.
    Models,
    /// Print the resolved configuration as TOML.
    Config,
}

#[derive(Args)]
struct ProcessArgs {
    #[arg(help = "Image to enhance")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Where to write the result; format follows the extension")]
    output: PathBuf,
    #[arg(long = "type", default_value = "upscaling")]
    processing_type: ProcessingType,
    #[arg(long, help = "ONNX model to use instead of the configured one")]
    model: Option<PathBuf>,
    #[arg(long, value_name = "PIXELS", help = "512, 768, 1024 or 2048")]
    tile_size: Option<u32>,
    #[arg(long, help = "Tile overlap fraction, 0.1 to 0.5 in steps of 0.1")]
    overlap: Option<f64>,
    #[arg(long, value_name = "N", help = "Tiles in flight at once (1 = sequential)")]
    parallel: Option<usize>,
    #[arg(long, value_name = "MS")]
    tile_delay_ms: Option<u64>,
    #[arg(long, value_name = "N", help = "Reject images needing more tiles (0 = unlimited)")]
    max_tiles: Option<usize>,
    #[arg(long)]
    seam: Option<SeamPolicy>,
    #[arg(long)]
    backend: Option<InferenceBackend>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    uppscale_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    uppscale_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Process(args) => run_process(args, config, &resolved_data_dir).await,
        Commands::Models => {
            print_models(&config, &resolved_data_dir);
            Ok(())
        }
        Commands::Config => {
            let encoded = toml::to_string_pretty(&config).context("failed to serialize config")?;
            print!("{encoded}");
            Ok(())
        }
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Folds command-line overrides into the loaded config.
fn apply_overrides(config: &mut AppConfig, args: &ProcessArgs) -> Result<()> {
    if let Some(pixels) = args.tile_size {
        config.processing.tile_size = TileSize::try_from(pixels)?;
    }
    if let Some(overlap) = args.overlap {
        config.processing.overlap = overlap;
    }
    if let Some(parallel) = args.parallel {
        config.processing.parallelism = parallel;
    }
    if let Some(delay) = args.tile_delay_ms {
        config.processing.tile_delay_ms = delay;
    }
    if let Some(max_tiles) = args.max_tiles {
        config.processing.max_tiles = max_tiles;
    }
    if let Some(seam) = args.seam {
        config.processing.seam = seam;
    }
    if let Some(backend) = args.backend {
        config.inference.backend = backend;
    }
    Ok(())
}

async fn run_process(args: ProcessArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    apply_overrides(&mut config, &args)?;
    let tiling = config.processing.tiling()?;

    let mut loader = config.onnx_loader(data_dir, args.processing_type);
    if let Some(model) = args.model.as_deref() {
        let cache_base = resolve_relative_to(data_dir, &config.paths.trt_cache_dir);
        loader.trt_cache_dir = Some(model_cache_dir(&cache_base, model));
        loader.model_path = model.to_path_buf();
    }

    let source = image_io::read_file(&args.input)?;
    info!(
        input = %args.input.display(),
        size = %source.upright_size(),
        processing_type = %args.processing_type,
        model = %loader.model_path.display(),
        backend = %loader.backend,
        tile_size = tiling.tile_size().pixels(),
        overlap = tiling.overlap(),
        "Starting processing"
    );

    let processor = Processor::with_options(Arc::new(loader), config.processor_options());
    let mut handle = processor.process(source, tiling);

    let cancel = handle.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let start = Instant::now();
    let mut result = None;
    while let Some(event) = handle.next_event().await {
        match event {
            RunEvent::Update(ProcessingUpdate::Progress(progress)) => {
                eprint!("\r{}    ", render_progress(&progress, start.elapsed().as_secs_f64()));
            }
            RunEvent::Update(ProcessingUpdate::Image(_)) => {}
            RunEvent::Finished(image) => result = Some(Ok(image)),
            RunEvent::Cancelled => result = Some(Err(anyhow!("processing cancelled"))),
            RunEvent::Failed(error) => {
                eprintln!();
                eprintln!("{}: {}", error.title(), error.recovery_suggestion());
                result = Some(Err(anyhow::Error::new(error).context("processing failed")));
            }
        }
    }
    ctrl_c.abort();
    eprintln!();

    let image = result.context("run ended without a result")??;
    image_io::save(&image, &args.output)?;

    info!(
        output = %args.output.display(),
        width = image.width(),
        height = image.height(),
        elapsed = %format_duration(start.elapsed().as_secs_f64()),
        "Processing complete"
    );
    Ok(())
}

fn print_models(config: &AppConfig, data_dir: &Path) {
    for line in model_listing(config, data_dir) {
        println!("{line}");
    }
}

/// One entry per processing type: name, title, model path and status,
/// followed by an indented description line.
fn model_listing(config: &AppConfig, data_dir: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for processing_type in ProcessingType::ALL {
        let path = config.model_path(data_dir, processing_type);
        let status = if path.is_file() { "found" } else { "missing" };
        lines.push(format!(
            "{:<16} {:<18} {} ({status})",
            processing_type.to_string(),
            processing_type.title(),
            path.display()
        ));
        lines.push(format!("    {}", processing_type.description()));
    }
    lines
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(progress: &ProcessingProgress, elapsed: f64) -> String {
    let fraction = progress.completion_ratio.unwrap_or(0.0).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    format!(
        "[{}] {:5.1}% | {} | Elapsed: {}",
        bar,
        fraction * 100.0,
        progress.message.as_deref().unwrap_or(""),
        format_duration(elapsed),
    )
}
