//! plateshift - Cancellable, concurrent copy/move for VFX image-sequence batches.
//!
//! Usage:
//!   plateshift apply REQUEST.json    Run a batch-apply request
//!   plateshift config                Print the effective configuration
//!   plateshift --help                Show help

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plateshift_core::{BatchRequest, BatchStatus, NativeToolMode, TransferConfig, TransferMode, WorkerConfig};
use plateshift_ops::{BatchCoordinator, BatchSummary, ProgressSnapshot, TransferEvent};

#[derive(Parser)]
#[command(
    name = "plateshift",
    version,
    about = "Cancellable, concurrent copy/move for VFX image-sequence batches",
    long_about = "plateshift copies or moves the files of a batch-apply request with bounded \
                  concurrency, chunk-level cancellation and throttled progress.\n\n\
                  Press Ctrl-C while a batch runs to cancel it; partially written files are removed."
)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch-apply request
    Apply(ApplyArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct ApplyArgs {
    /// JSON batch-apply request
    request: PathBuf,

    /// Override the request's operation type
    #[arg(short, long)]
    mode: Option<ModeArg>,

    /// Maximum files transferred at once
    #[arg(long)]
    files: Option<usize>,

    /// Maximum parallel ranges per large file
    #[arg(long)]
    chunks: Option<usize>,

    /// Chunk size (e.g., "512K", "4M")
    #[arg(long)]
    chunk_size: Option<String>,

    /// Native copy tool: "auto", "off", or a program path
    #[arg(long, value_parser = parse_native)]
    native: Option<NativeToolMode>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Copy,
    Move,
}

impl From<ModeArg> for TransferMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Copy => TransferMode::Copy,
            ModeArg::Move => TransferMode::Move,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Apply(args) => {
            let status = run_apply(config, args).await?;
            let code = match status {
                BatchStatus::Completed => 0,
                BatchStatus::Cancelled => 130,
                _ => 1,
            };
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

/// Install the tracing subscriber; `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "plateshift=info",
        1 => "plateshift=debug",
        _ => "plateshift=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load the configuration from an explicit path or the default location.
fn load_config(path: Option<&Path>) -> Result<TransferConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            TransferConfig::load(path)
                .wrap_err_with(|| format!("Failed to load config from {}", path.display()))
        }
        None => match TransferConfig::default_path() {
            Some(path) => TransferConfig::load(&path)
                .wrap_err_with(|| format!("Failed to load config from {}", path.display())),
            None => Ok(TransferConfig::default()),
        },
    }
}

/// Run a batch-apply request to completion, cancelling on Ctrl-C.
async fn run_apply(mut config: TransferConfig, args: ApplyArgs) -> Result<BatchStatus> {
    if let Some(size) = &args.chunk_size {
        config.chunk_size = usize::try_from(parse_size(size)?)?;
    }
    if let Some(native) = args.native.clone() {
        config.native_tool = native;
    }

    let content = std::fs::read_to_string(&args.request)
        .wrap_err_with(|| format!("Failed to read {}", args.request.display()))?;
    let mut request = BatchRequest::from_json(&content)?;
    if let Some(mode) = args.mode {
        request.operation_type = mode.into();
    }
    if args.files.is_some() || args.chunks.is_some() {
        let base = request.worker_config.unwrap_or(config.workers);
        request.worker_config = Some(WorkerConfig::new(
            args.files.unwrap_or(base.max_file_concurrency),
            args.chunks.unwrap_or(base.max_chunk_concurrency),
        ));
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = BatchCoordinator::new(config)?.with_sink(Arc::new(tx));
    let batch_id = coordinator.start_request(request)?;
    info!("started batch {}", batch_id);

    let mut interrupted = false;
    let summary = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransferEvent::Progress(snapshot)) => {
                    if !args.json {
                        print_progress(&snapshot);
                    }
                }
                Some(TransferEvent::Finished(summary)) => break summary,
                None => return Err(eyre!("Transfer engine stopped without a summary")),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("interrupted, cancelling batch {}", batch_id);
                coordinator.cancel(&batch_id);
            }
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(summary.status)
}

fn print_progress(snapshot: &ProgressSnapshot) {
    let eta = snapshot
        .eta_seconds
        .map(|s| format!(", eta {}m{:02}s", s / 60, s % 60))
        .unwrap_or_default();
    eprintln!(
        " {:>5.1}%  {}/{} files  {} / {}{}",
        snapshot.percentage,
        snapshot.files_processed,
        snapshot.total_files,
        format_size(snapshot.bytes_processed),
        format_size(snapshot.total_bytes),
        eta
    );
}

fn print_summary(summary: &BatchSummary) {
    let elapsed = (summary.finished_at - summary.started_at)
        .to_std()
        .unwrap_or_default();

    println!();
    println!("{}", "─".repeat(60));
    println!(" Batch {} ({}) {}", summary.batch_id, summary.mode, summary.status);
    println!(" {}", summary.summary_line());
    println!(
        " {} in {:.2}s",
        format_size(summary.bytes_transferred),
        elapsed.as_secs_f64()
    );
    println!("{}", "─".repeat(60));

    if !summary.failed.is_empty() {
        println!();
        println!(" Failed:");
        for failed in &summary.failed {
            match &failed.error {
                Some(error) => println!("   {} {:?}: {}", failed.operation_id, failed.kind, error),
                None => println!("   {} {:?}", failed.operation_id, failed.kind),
            }
        }
    }

    if !summary.warnings.is_empty() {
        println!();
        println!(" {} warning(s):", summary.warnings.len());
        for warning in &summary.warnings {
            println!("   {}", warning.message);
        }
    }
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Parse a size string (e.g., "4096", "512K", "4MB", "1G").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let multiplier: u64 = match s[digits.len()..].trim_end_matches('B') {
        "" => 1,
        "K" | "KI" => 1024,
        "M" | "MI" => 1024 * 1024,
        "G" | "GI" => 1024 * 1024 * 1024,
        unit => bail!("Unknown size unit: {unit}"),
    };
    let num: f64 = digits
        .trim()
        .parse()
        .wrap_err_with(|| format!("Invalid size: {s}"))?;
    Ok((num * multiplier as f64) as u64)
}

/// Parse the `--native` argument.
fn parse_native(s: &str) -> std::result::Result<NativeToolMode, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" => Err("expected auto, off or a program path".to_string()),
        "auto" => Ok(NativeToolMode::Auto),
        "off" | "none" | "disabled" => Ok(NativeToolMode::Disabled),
        _ => Ok(NativeToolMode::Program(PathBuf::from(s.trim()))),
    }
}
