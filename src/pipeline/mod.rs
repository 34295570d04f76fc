//! Segmentation pipeline
//!
//! Ties the stages together under the adaptive scheduler:
//! frame → preprocess → worker → extract → stabilize → latest mask.
//!
//! The pipeline either runs live inference or serves the static demo mask.
//! Both are variants of [`MaskSource`] and the switch between them is
//! driven by the scheduler's fallback latch.

mod thread;

pub use thread::{SegmentationThread, ThreadStatus};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::camera::{CameraFrame, FrameSource};
use crate::compositor::{CompositeFrame, CompositorParams};
use crate::error::{InferenceFailure, LoadError};
use crate::ml::synthetic::SyntheticManifest;
use crate::ml::{EngineRegistry, ModelArtifact, ModelCache, Worker};
use crate::scheduler::{AdaptiveScheduler, SchedulerMode, SchedulerState};
use crate::segmentation::{preprocess, Mask, MaskExtractor, MaskHistory};
use crate::settings::{OutputSettings, PipelineSettings};
use crate::telemetry::{InferenceProfiler, InferenceStats};

const FORCED_DEMO_REASON: &str = "demo mode forced by configuration";

/// Shared stop request for a pipeline
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Degraded-mode indicator for the host UI
#[derive(Debug, Clone, Default)]
pub struct FallbackSignal {
    reason: Arc<Mutex<Option<String>>>,
}

impl FallbackSignal {
    pub fn is_active(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    fn set(&self, reason: &str) {
        *self.reason.lock() = Some(reason.to_string());
    }

    fn clear(&self) {
        *self.reason.lock() = None;
    }
}

/// Live inference: a worker plus the extractor for its outputs
pub struct LiveSource {
    worker: Worker,
    extractor: MaskExtractor,
}

impl LiveSource {
    pub fn new(worker: Worker, extractor: MaskExtractor) -> Self {
        Self { worker, extractor }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// preprocess → execute → fetch → extract
    fn run(
        &mut self,
        frame: &CameraFrame,
        width: u32,
        height: u32,
    ) -> Result<Mask, InferenceFailure> {
        let input = preprocess(frame, self.worker.spec())
            .map_err(|e| InferenceFailure::new(format!("preprocess: {}", e)))?;
        self.worker.execute(input)?;
        let output_name = self.worker.spec().output_name.clone();
        let output = self.worker.fetch_output(&output_name)?;
        Ok(self.extractor.extract(output, width, height))
    }
}

/// Static demo mask served while live inference is unavailable
pub struct FallbackMask {
    reason: String,
    cached: Option<Mask>,
    /// Live source to resume on reset
    suspended: Option<Box<LiveSource>>,
}

impl FallbackMask {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            cached: None,
            suspended: None,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn mask(&mut self, width: u32, height: u32) -> Mask {
        match &self.cached {
            Some(mask) if mask.dimensions() == (width, height) => mask.clone(),
            _ => {
                let mask = Mask::demo(width, height);
                self.cached = Some(mask.clone());
                mask
            }
        }
    }
}

/// Where masks come from
pub enum MaskSource {
    Live(LiveSource),
    Fallback(FallbackMask),
}

impl MaskSource {
    /// Unstabilized mask for `frame` at `width` x `height`
    pub fn produce(
        &mut self,
        frame: &CameraFrame,
        width: u32,
        height: u32,
    ) -> Result<Mask, InferenceFailure> {
        match self {
            MaskSource::Live(live) => live.run(frame, width, height),
            MaskSource::Fallback(fallback) => Ok(fallback.mask(width, height)),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, MaskSource::Fallback(_))
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            MaskSource::Live(_) => None,
            MaskSource::Fallback(fallback) => Some(fallback.reason()),
        }
    }
}

/// What one call to [`SegmentationPipeline::tick`] did
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// No run was due, no frame was available, or the pipeline is stopped
    Skipped,
    /// A new stabilized mask is available
    Processed { duration: Duration },
    /// The run finished after a stop request; its result was dropped
    Discarded,
    /// The chain failed; counted by the scheduler
    Failed(InferenceFailure),
    /// The static demo mask was served
    Fallback,
}

/// One segmentation pipeline instance
///
/// Owns its worker, mask history and scheduler state. Nothing is shared
/// between instances.
pub struct SegmentationPipeline {
    source: MaskSource,
    history: MaskHistory,
    scheduler: AdaptiveScheduler,
    profiler: InferenceProfiler,
    output: OutputSettings,
    compositor: CompositorParams,
    latest: Option<Mask>,
    stop: StopHandle,
    fallback: FallbackSignal,
}

impl SegmentationPipeline {
    /// Live pipeline around an existing worker
    pub fn new(worker: Worker, settings: &PipelineSettings) -> Self {
        let extractor = MaskExtractor::from_settings(&settings.model);
        Self::with_source(
            MaskSource::Live(LiveSource::new(worker, extractor)),
            settings,
        )
    }

    /// Pipeline that serves the demo mask from the start
    pub fn fallback(reason: impl Into<String>, settings: &PipelineSettings) -> Self {
        let mut pipeline = Self::with_source(
            MaskSource::Fallback(FallbackMask::new(reason)),
            settings,
        );
        pipeline.sync_fallback();
        pipeline
    }

    fn with_source(source: MaskSource, settings: &PipelineSettings) -> Self {
        Self {
            source,
            history: MaskHistory::from_settings(&settings.stabilizer),
            scheduler: AdaptiveScheduler::new(settings.scheduler.clone()),
            profiler: InferenceProfiler::default(),
            output: settings.output.clone(),
            compositor: settings.compositor,
            latest: None,
            stop: StopHandle::default(),
            fallback: FallbackSignal::default(),
        }
    }

    /// Load the configured model and create a worker for it
    ///
    /// Only model loading errors are fatal. A missing compute backend puts
    /// the pipeline into fallback instead.
    pub fn build(
        settings: &PipelineSettings,
        registry: &EngineRegistry,
        cache: &mut ModelCache,
    ) -> Result<Self, LoadError> {
        if settings.force_demo_mode {
            tracing::info!(target: "wall_segmentation::pipeline", "{}", FORCED_DEMO_REASON);
            return Ok(Self::fallback(FORCED_DEMO_REASON, settings));
        }

        let model = &settings.model;
        let engine = registry.require(&model.engine)?;
        let artifact = match &model.path {
            Some(path) => ModelArtifact::Path(path.clone()),
            None if engine.name() == "synthetic" => SyntheticManifest::default().to_artifact(),
            None => {
                return Err(LoadError::InvalidArtifact(format!(
                    "engine '{}' needs a model path",
                    model.engine
                )))
            }
        };

        let handle = cache.get_or_load(&model.cache_key(), engine.as_ref(), &artifact, model)?;
        match Worker::create(&handle, model.backend) {
            Ok(worker) => Ok(Self::new(worker, settings)),
            Err(e) => {
                tracing::error!(target: "wall_segmentation::pipeline", "{}", e);
                Ok(Self::fallback(e.to_string(), settings))
            }
        }
    }

    /// Advance the pipeline by one timer tick
    pub fn tick(&mut self, now: Instant, frames: &mut dyn FrameSource) -> TickOutcome {
        if self.stop.is_stop_requested() {
            return TickOutcome::Skipped;
        }

        if self.source.is_fallback() {
            return self.serve_fallback(frames);
        }

        if !self.scheduler.is_due(now) {
            return TickOutcome::Skipped;
        }
        let Some(frame) = frames.current_frame() else {
            return TickOutcome::Skipped;
        };
        let (width, height) = self.mask_size(&frame);

        self.scheduler.begin_run(now);
        let started = Instant::now();
        let result = self.source.produce(&frame, width, height);
        let duration = started.elapsed();
        self.scheduler.complete_run(duration, &result);
        self.profiler.record_run(
            duration,
            result.is_ok(),
            self.scheduler.state().current_interval_secs,
        );
        self.maybe_log_stats();

        // A latched fallback must reach the source even when the result is discarded.
        if result.is_err() && self.scheduler.mode() == SchedulerMode::Fallback {
            self.suspend_live();
        }

        if self.stop.is_stop_requested() {
            self.profiler.record_discard();
            tracing::debug!(
                target: "wall_segmentation::pipeline",
                frame = frame.frame_number,
                "stop requested during run, result discarded"
            );
            return TickOutcome::Discarded;
        }

        match result {
            Ok(mask) => {
                self.latest = Some(self.history.push(mask));
                TickOutcome::Processed { duration }
            }
            Err(failure) => TickOutcome::Failed(failure),
        }
    }

    fn serve_fallback(&mut self, frames: &mut dyn FrameSource) -> TickOutcome {
        let size = match (&self.latest, self.output.mask_width, self.output.mask_height) {
            (_, Some(w), Some(h)) => Some((w, h)),
            (Some(mask), _, _) => Some(mask.dimensions()),
            (None, _, _) => frames.current_frame().map(|frame| self.mask_size(&frame)),
        };
        let Some((width, height)) = size else {
            return TickOutcome::Skipped;
        };
        if let MaskSource::Fallback(fallback) = &mut self.source {
            self.latest = Some(fallback.mask(width, height));
        }
        TickOutcome::Fallback
    }

    /// Swap the live source out for the demo mask, keeping it for reset
    fn suspend_live(&mut self) {
        let reason = self
            .scheduler
            .state()
            .fallback_reason
            .clone()
            .unwrap_or_else(|| "inference failing".to_string());
        let previous = std::mem::replace(
            &mut self.source,
            MaskSource::Fallback(FallbackMask::new(reason.clone())),
        );
        if let (MaskSource::Live(live), MaskSource::Fallback(fallback)) =
            (previous, &mut self.source)
        {
            fallback.suspended = Some(Box::new(live));
        }
        self.history.clear();
        self.fallback.set(&reason);
    }

    /// Keep the scheduler latch and the UI signal in step with the source
    fn sync_fallback(&mut self) {
        if let Some(reason) = self.source.fallback_reason().map(str::to_string) {
            self.scheduler.enter_fallback(reason.clone());
            self.fallback.set(&reason);
        }
    }

    fn mask_size(&self, frame: &CameraFrame) -> (u32, u32) {
        (
            self.output.mask_width.unwrap_or(frame.width),
            self.output.mask_height.unwrap_or(frame.height),
        )
    }

    fn maybe_log_stats(&self) {
        let every = self.scheduler.settings().stats_every_runs;
        if every == 0 || self.profiler.runs() % every != 0 {
            return;
        }
        let stats = self.profiler.stats();
        tracing::info!(
            target: "wall_segmentation::pipeline",
            avg_ms = stats.avg_ms,
            min_ms = stats.min_ms,
            max_ms = stats.max_ms,
            p95_ms = stats.p95_ms,
            runs = stats.runs,
            failures = stats.failures,
            interval_secs = stats.interval_secs,
            "inference stats"
        );
    }

    /// Leave fallback and resume live inference, if a live source exists
    ///
    /// Returns whether the pipeline is live afterwards.
    pub fn reset(&mut self) -> bool {
        self.scheduler.reset();
        self.history.clear();
        self.latest = None;

        if let MaskSource::Fallback(fallback) = &mut self.source {
            if let Some(live) = fallback.suspended.take() {
                self.source = MaskSource::Live(*live);
            }
        }

        if self.source.is_fallback() {
            // Nothing to resume; stay latched.
            self.sync_fallback();
            false
        } else {
            self.fallback.clear();
            true
        }
    }

    /// Most recent stabilized (or demo) mask
    pub fn latest_stabilized_mask(&self) -> Option<&Mask> {
        self.latest.as_ref()
    }

    /// Latest mask packaged for the compositor
    pub fn composite_frame(&self) -> Option<CompositeFrame> {
        self.latest
            .clone()
            .map(|mask| CompositeFrame::new(mask, self.compositor, self.fallback.reason()))
    }

    pub fn mode(&self) -> SchedulerMode {
        self.scheduler.mode()
    }

    pub fn scheduler_state(&self) -> &SchedulerState {
        self.scheduler.state()
    }

    pub fn source(&self) -> &MaskSource {
        &self.source
    }

    pub fn stats(&self) -> InferenceStats {
        self.profiler.stats()
    }

    /// Why the worker runs on a lesser backend than requested, if it does
    pub fn degraded(&self) -> Option<&str> {
        match &self.source {
            MaskSource::Live(live) => live.worker.degraded(),
            MaskSource::Fallback(_) => None,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn fallback_signal(&self) -> FallbackSignal {
        self.fallback.clone()
    }

    /// Stop scheduling runs; a run in progress finishes but is discarded
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    pub fn compositor_params(&self) -> CompositorParams {
        self.compositor
    }

    pub fn set_compositor_params(&mut self, mut params: CompositorParams) {
        params.sanitize();
        self.compositor = params;
    }
}
