//! Clearcut CLI
//!
//! `remove` runs files through the batch queue and matting worker.
//! `select` runs one point-prompted selection and writes the cut-out.

use super::backend_factory::{promptable_factory, segmenter_factory};
use super::config::{parse_point, CliConfigBuilder};
use crate::{
    client::SegmentationClient,
    config::OutputFormat,
    coordinator::{run_batch_with, ProcessStatus, ProcessingCoordinator},
    preview::PreviewRegistry,
    protocol::WorkerStatus,
    tracing_config::{spans, TracingConfig, TracingFormat},
    types::ItemId,
    worker::{spawn_matting_worker, spawn_segmentation_worker},
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "bmp", "tiff", "tif"];

/// On-device background removal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "clearcut")]
pub struct Cli {
    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Execution provider: auto, gpu or cpu
    #[arg(short, long, default_value = "auto", global = true)]
    pub execution_provider: String,

    /// Compact log output without colors
    #[arg(long, global = true)]
    pub compact_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remove backgrounds from images or directories
    Remove(RemoveArgs),
    /// Cut out a region selected with keep/remove points
    Select(SelectArgs),
    /// Show execution provider availability
    Providers,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Input image files or directories
    #[arg(value_name = "INPUT", required = true)]
    pub input: Vec<PathBuf>,

    /// Segmentation model (ONNX)
    #[arg(short, long)]
    pub model: PathBuf,

    /// Output directory [default: next to each input]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = CliOutputFormat::Png)]
    pub format: CliOutputFormat,

    /// Guided filter regularization
    #[arg(long, default_value_t = 1e-4)]
    pub epsilon: f32,

    /// Fixed guided filter radius [default: adaptive]
    #[arg(long)]
    pub radius: Option<usize>,

    /// Alpha below this value becomes fully transparent
    #[arg(long, default_value_t = 0.2)]
    pub alpha_floor: f32,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Only process files whose name contains this text
    #[arg(long)]
    pub pattern: Option<String>,
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Input image
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Promptable model encoder (ONNX)
    #[arg(long)]
    pub encoder: PathBuf,

    /// Promptable model decoder (ONNX)
    #[arg(long)]
    pub decoder: PathBuf,

    /// Point to keep, as x,y in image pixels (repeatable)
    #[arg(long, value_parser = parse_point)]
    pub keep: Vec<(f32, f32)>,

    /// Point to remove, as x,y in image pixels (repeatable)
    #[arg(long, value_parser = parse_point)]
    pub remove: Vec<(f32, f32)>,

    /// Shifts the decision boundary (0-1)
    #[arg(long, default_value_t = 0.5)]
    pub sensitivity: f32,

    /// Softens the mask transition (0-1)
    #[arg(long, default_value_t = 0.5)]
    pub smoothness: f32,

    /// Use this candidate mask instead of the highest scoring one
    #[arg(long)]
    pub mask_index: Option<usize>,

    /// Probability below which pixels are removed
    #[arg(long, default_value_t = 0.55)]
    pub decision: f32,

    /// Probability from which pixels are fully kept
    #[arg(long, default_value_t = 0.70)]
    pub feather_end: f32,

    /// Do not add implicit remove points at the corners
    #[arg(long)]
    pub no_corner_anchors: bool,

    /// Decode debounce in milliseconds
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Output file [default: <input>_cut.<format>]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Also write the overlay mask as PNG
    #[arg(long)]
    pub overlay: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = CliOutputFormat::Png)]
    pub format: CliOutputFormat,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum CliOutputFormat {
    Png,
    Tiff,
    Webp,
    Rgba8,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.compact_logs {
        TracingFormat::Compact
    } else {
        TracingFormat::Console
    };
    TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(format)
        .with_run_id(uuid::Uuid::new_v4().to_string())
        .init()
        .context("Failed to initialize tracing subscriber")?;

    match &cli.command {
        Command::Remove(args) => remove(&cli, args).await,
        Command::Select(args) => select(&cli, args).await,
        Command::Providers => {
            show_providers();
            Ok(())
        },
    }
}

fn show_providers() {
    let gpu = crate::backends::available_gpu_providers();
    println!("Execution providers");
    println!("  cpu: available");
    if gpu.is_empty() {
        println!("  gpu: not available (auto falls back to cpu)");
    } else {
        println!("  gpu: available ({})", gpu.join(", "));
    }
}

async fn remove(cli: &Cli, args: &RemoveArgs) -> Result<()> {
    let files = collect_images(&args.input, args.recursive, args.pattern.as_deref())?;
    if files.is_empty() {
        warn!("No supported images found in the provided inputs");
        return Ok(());
    }

    let coordinator_config = CliConfigBuilder::coordinator(&cli.execution_provider)?;
    let matting_config = CliConfigBuilder::matting(args)?;
    let output_format = matting_config.output_format;
    let factory = segmenter_factory(&args.model)?;

    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    }

    let previews = PreviewRegistry::new();
    let mut coordinator = ProcessingCoordinator::new(previews.clone());
    let mut paths: HashMap<ItemId, PathBuf> = HashMap::new();
    for path in &files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let id = coordinator.add_image(path.display().to_string(), bytes, ProcessStatus::Queued)?;
        paths.insert(id, path.clone());
    }
    info!("Found {} image(s) to process", files.len());

    let mut worker = spawn_matting_worker(factory, matting_config, &coordinator_config)?;

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let summary = run_batch_with(&mut coordinator, &mut worker, |coordinator, status| {
        match status {
            WorkerStatus::Ready { provider } => progress.set_message(format!("model on {}", provider)),
            WorkerStatus::Processing { id } => {
                if let Some(item) = coordinator.item(*id) {
                    progress.set_message(item.name.clone());
                }
            },
            WorkerStatus::Complete { .. } | WorkerStatus::Error { id: Some(_), .. } => progress.inc(1),
            _ => {},
        }
    })
    .instrument(spans::batch(files.len(), &cli.execution_provider))
    .await?;
    progress.finish_with_message(format!(
        "Completed! Processed: {}, Failed: {}",
        summary.done, summary.failed
    ));

    for item in coordinator.items() {
        let Some(input) = paths.get(&item.id) else {
            continue;
        };
        match (item.status, &item.result) {
            (ProcessStatus::Done, Some(result)) => {
                let output = CliConfigBuilder::output_path(input, args.output.as_deref(), output_format);
                tokio::fs::write(&output, result)
                    .await
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                debug!("Wrote {}", output.display());
            },
            (ProcessStatus::Error, _) => {
                error!(
                    "Failed to process {}: {}",
                    input.display(),
                    item.error.as_deref().unwrap_or("unknown error")
                );
            },
            _ => {},
        }
    }

    coordinator.reset_all()?;
    worker.terminate();
    info!(
        "Processed {} image(s) in {:.2}s ({} failed)",
        summary.done,
        start.elapsed().as_secs_f64(),
        summary.failed
    );
    Ok(())
}

async fn select(cli: &Cli, args: &SelectArgs) -> Result<()> {
    let points = CliConfigBuilder::points(args);
    if points.is_empty() {
        bail!("At least one --keep or --remove point is required");
    }

    let coordinator_config = CliConfigBuilder::coordinator(&cli.execution_provider)?;
    let segmentation_config = CliConfigBuilder::segmentation(args)?;
    let factory = promptable_factory(&args.encoder, &args.decoder)?;
    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;

    let span = spans::selection(&args.input, points.len());
    let previews = PreviewRegistry::new();
    let worker = spawn_segmentation_worker(factory, segmentation_config.clone(), &coordinator_config)?;
    let mut client = SegmentationClient::open(worker, previews.clone(), bytes, &segmentation_config).await?;

    let (width, height) = client.natural_size();
    for point in &points {
        if point.x >= width as f32 || point.y >= height as f32 {
            bail!(
                "Point ({}, {}) lies outside the {}x{} image",
                point.x,
                point.y,
                width,
                height
            );
        }
    }

    client.set_sensitivity(args.sensitivity).await?;
    client.set_smoothness(args.smoothness).await?;
    client.set_mask_index(args.mask_index).await?;
    for point in points {
        client.add_point(point).await?;
    }
    let masks = match client.wait_for_masks().instrument(span).await {
        Ok(masks) => masks,
        Err(e) if e.is_recoverable() => {
            bail!("Selection failed: {}. Adjust the points, --mask-index or thresholds and retry", e)
        },
        Err(e) => return Err(e.into()),
    };
    if let Some(provider) = client.provider() {
        info!("Promptable model ran on {}", provider);
    }

    let format: OutputFormat = args.format.into();
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| CliConfigBuilder::output_path(&args.input, None, format));
    let cut = client.extract(format)?;
    tokio::fs::write(&output, cut)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Wrote {}", output.display());

    if let Some(overlay) = &args.overlay {
        let display = previews
            .get(masks.display)
            .context("Overlay mask is no longer available")?;
        tokio::fs::write(overlay, &display[..])
            .await
            .with_context(|| format!("Failed to write {}", overlay.display()))?;
    }

    client.close()?;
    Ok(())
}

/// Collect supported images from files and directories, sorted
fn collect_images(inputs: &[PathBuf], recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            if is_image_file(input) {
                files.push(input.clone());
            } else {
                warn!("Skipping unsupported file: {}", input.display());
            }
        } else if input.is_dir() {
            let walker = walkdir::WalkDir::new(input).max_depth(if recursive { usize::MAX } else { 1 });
            for entry in walker {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type().is_file() && is_image_file(path) && matches_pattern(path, pattern) {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            bail!("Input path does not exist or is not accessible: {}", input.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    pattern.map_or(true, |pattern| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(pattern))
    })
}
