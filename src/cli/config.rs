//! Conversion of CLI arguments into library configuration

use crate::cli::main_impl::{CliOutputFormat, RemoveArgs, SelectArgs};
use crate::{
    config::{CoordinatorConfig, ExecutionProvider, MattingConfig, OutputFormat, SegmentationConfig},
    types::Point,
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

impl From<CliOutputFormat> for OutputFormat {
    fn from(format: CliOutputFormat) -> Self {
        match format {
            CliOutputFormat::Png => Self::Png,
            CliOutputFormat::Tiff => Self::Tiff,
            CliOutputFormat::Webp => Self::WebP,
            CliOutputFormat::Rgba8 => Self::Rgba8,
        }
    }
}

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    pub(crate) fn coordinator(provider: &str) -> Result<CoordinatorConfig> {
        let execution_provider: ExecutionProvider = provider
            .parse()
            .with_context(|| format!("Invalid execution provider '{}'", provider))?;
        Ok(CoordinatorConfig {
            execution_provider,
            ..CoordinatorConfig::default()
        })
    }

    pub(crate) fn matting(args: &RemoveArgs) -> Result<MattingConfig> {
        let mut builder = MattingConfig::builder()
            .epsilon(args.epsilon)
            .alpha_floor(args.alpha_floor)
            .output_format(args.format.into());
        if let Some(radius) = args.radius {
            builder = builder.radius(radius);
        }
        builder.build().context("Invalid matting parameters")
    }

    pub(crate) fn segmentation(args: &SelectArgs) -> Result<SegmentationConfig> {
        let mut builder = SegmentationConfig::builder()
            .thresholds(args.decision, args.feather_end)
            .corner_anchors(!args.no_corner_anchors);
        if let Some(debounce) = args.debounce_ms {
            builder = builder.debounce_ms(debounce);
        }
        builder.build().context("Invalid selection parameters")
    }

    /// All prompt points in natural image coordinates, keep points first
    pub(crate) fn points(args: &SelectArgs) -> Vec<Point> {
        args.keep
            .iter()
            .map(|&(x, y)| Point::keep(x, y))
            .chain(args.remove.iter().map(|&(x, y)| Point::remove(x, y)))
            .collect()
    }

    /// Output file for `input` inside `dir` (or next to the input)
    pub(crate) fn output_path(input: &Path, dir: Option<&Path>, format: OutputFormat) -> PathBuf {
        let stem = input.file_stem().unwrap_or_default().to_string_lossy();
        let file_name = format!("{}_cut.{}", stem, format.extension());
        match dir {
            Some(dir) => dir.join(file_name),
            None => input.parent().unwrap_or_else(|| Path::new(".")).join(file_name),
        }
    }
}

/// Parse an `x,y` point
pub(crate) fn parse_point(value: &str) -> std::result::Result<(f32, f32), String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got '{}'", value))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<f32>()
            .map_err(|e| format!("invalid coordinate '{}': {}", part, e))
    };
    let point = (parse(x)?, parse(y)?);
    if !point.0.is_finite() || !point.1.is_finite() || point.0 < 0.0 || point.1 < 0.0 {
        return Err(format!("coordinates must be finite and non-negative: '{}'", value));
    }
    Ok(point)
}
