//! Wall Segmentation - Headless Runner
//!
//! Runs the segmentation pipeline against a still image or procedural
//! frames and writes the final stabilized mask as a grayscale PNG.
//!
//! Usage: `wall-segmentation [settings.json] [image]`

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use wall_segmentation::camera::{FrameSource, StillImageSource, SyntheticFrameSource};
use wall_segmentation::compositor::threshold_for_display;
use wall_segmentation::ml::{EngineRegistry, ModelCache};
use wall_segmentation::pipeline::{SegmentationPipeline, TickOutcome};
use wall_segmentation::settings::PipelineSettings;
use wall_segmentation::telemetry::{init_logging, LogConfig};

const TICKS: u32 = 60;
const TICK_PERIOD: Duration = Duration::from_millis(33);
const SYNTHETIC_WIDTH: u32 = 320;
const SYNTHETIC_HEIGHT: u32 = 240;
const MASK_OUTPUT: &str = "mask.png";
const BINARY_OUTPUT: &str = "mask_binary.png";

fn load_settings(path: Option<&Path>) -> Result<PipelineSettings> {
    match path {
        Some(path) => PipelineSettings::load_from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => {
            tracing::info!("no settings file given, using defaults");
            Ok(PipelineSettings::default())
        }
    }
}

fn frame_source(image: Option<&Path>) -> Result<Box<dyn FrameSource>> {
    match image {
        Some(path) => {
            let source = StillImageSource::open(path)
                .with_context(|| format!("failed to open image {}", path.display()))?;
            Ok(Box::new(source))
        }
        None => Ok(Box::new(SyntheticFrameSource::new(
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
            7,
        ))),
    }
}

fn main() -> Result<()> {
    // Keep the guard alive for the program duration
    let _log_guard = match init_logging(&LogConfig::default()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    tracing::info!("Wall Segmentation v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    let settings = load_settings(args.first().map(PathBuf::as_path))?;
    let mut frames = frame_source(args.get(1).map(PathBuf::as_path))?;

    let registry = EngineRegistry::with_builtin();
    tracing::info!(engines = ?registry.names(), "inference engines available");
    let mut cache = ModelCache::new();
    let mut pipeline = SegmentationPipeline::build(&settings, &registry, &mut cache)
        .context("failed to build segmentation pipeline")?;

    if let Some(reason) = pipeline.degraded() {
        tracing::warn!("running degraded: {}", reason);
    }

    let mut processed = 0u32;
    for _ in 0..TICKS {
        match pipeline.tick(Instant::now(), frames.as_mut()) {
            TickOutcome::Processed { duration } => {
                processed += 1;
                tracing::debug!(duration_ms = duration.as_secs_f64() * 1000.0, "mask updated");
            }
            TickOutcome::Failed(failure) => tracing::warn!("{}", failure),
            TickOutcome::Fallback | TickOutcome::Skipped | TickOutcome::Discarded => {}
        }
        std::thread::sleep(TICK_PERIOD);
    }

    let stats = pipeline.stats();
    tracing::info!(
        processed,
        mode = ?pipeline.mode(),
        avg_ms = stats.avg_ms,
        p95_ms = stats.p95_ms,
        runs_per_second = stats.runs_per_second(),
        "run finished"
    );

    let Some(mask) = pipeline.latest_stabilized_mask() else {
        tracing::warn!("no mask was produced");
        return Ok(());
    };
    mask.to_gray_image()
        .save(MASK_OUTPUT)
        .with_context(|| format!("failed to write {}", MASK_OUTPUT))?;
    threshold_for_display(mask, mask.threshold())
        .to_gray_image()
        .save(BINARY_OUTPUT)
        .with_context(|| format!("failed to write {}", BINARY_OUTPUT))?;
    tracing::info!(
        width = mask.width(),
        height = mask.height(),
        coverage = mask.coverage(mask.threshold()),
        "wrote {} and {}",
        MASK_OUTPUT,
        BINARY_OUTPUT
    );

    Ok(())
}
