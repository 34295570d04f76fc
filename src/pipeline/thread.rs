//! Background segmentation thread
//!
//! Runs a [`SegmentationPipeline`] off the render thread. The host pushes
//! camera frames without blocking and reads back the newest composite
//! frame whenever it draws.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{FallbackSignal, SegmentationPipeline, StopHandle, TickOutcome};
use crate::camera::{CameraFrame, FrameSource};
use crate::compositor::CompositeFrame;
use crate::scheduler::SchedulerMode;
use crate::telemetry::InferenceStats;

/// How long the thread waits for a frame before checking for control requests
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pipeline state as seen from outside the thread
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadStatus {
    pub mode: SchedulerMode,
    pub interval_secs: f64,
    pub consecutive_errors: u32,
    pub fallback_reason: Option<String>,
    /// Set when the worker runs on a lesser backend than requested
    pub degraded: Option<String>,
    pub stats: InferenceStats,
}

impl ThreadStatus {
    fn of(pipeline: &SegmentationPipeline) -> Self {
        let state = pipeline.scheduler_state();
        Self {
            mode: state.mode,
            interval_secs: state.current_interval_secs,
            consecutive_errors: state.consecutive_errors,
            fallback_reason: state.fallback_reason.clone(),
            degraded: pipeline.degraded().map(str::to_string),
            stats: pipeline.stats(),
        }
    }
}

/// Holds the newest frame handed over by the host
#[derive(Default)]
struct Mailbox {
    frame: Option<CameraFrame>,
}

impl FrameSource for Mailbox {
    fn current_frame(&mut self) -> Option<CameraFrame> {
        self.frame.take()
    }
}

/// Segmentation pipeline on its own thread
pub struct SegmentationThread {
    /// Latest composite frame from the pipeline
    latest: Arc<Mutex<Option<CompositeFrame>>>,
    /// Latest pipeline status
    status: Arc<Mutex<ThreadStatus>>,
    /// Channel to send frames to the pipeline thread
    frame_sender: Option<Sender<CameraFrame>>,
    /// Whether the thread loop is alive
    running: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
    stop: StopHandle,
    fallback: FallbackSignal,
    thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl SegmentationThread {
    /// Move `pipeline` onto a new thread and start it
    pub fn spawn(pipeline: SegmentationPipeline) -> std::io::Result<Self> {
        let latest = Arc::new(Mutex::new(None));
        let status = Arc::new(Mutex::new(ThreadStatus::of(&pipeline)));
        let running = Arc::new(AtomicBool::new(true));
        let reset_requested = Arc::new(AtomicBool::new(false));
        let stop = pipeline.stop_handle();
        let fallback = pipeline.fallback_signal();

        let (frame_sender, frame_receiver) = crossbeam_channel::bounded::<CameraFrame>(2);

        let shared = Shared {
            latest: latest.clone(),
            status: status.clone(),
            running: running.clone(),
            reset_requested: reset_requested.clone(),
        };

        let thread_handle = std::thread::Builder::new()
            .name("wall-segmentation".to_string())
            .spawn(move || Self::pipeline_thread(pipeline, frame_receiver, shared))?;

        Ok(Self {
            latest,
            status,
            frame_sender: Some(frame_sender),
            running,
            reset_requested,
            stop,
            fallback,
            thread_handle: Some(thread_handle),
        })
    }

    /// Pipeline thread main loop
    fn pipeline_thread(
        mut pipeline: SegmentationPipeline,
        frame_receiver: Receiver<CameraFrame>,
        shared: Shared,
    ) {
        tracing::info!(target: "wall_segmentation::thread", "segmentation thread started");
        let stop = pipeline.stop_handle();
        let mut mailbox = Mailbox::default();

        loop {
            match frame_receiver.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => {
                    // Only the newest queued frame is worth segmenting.
                    mailbox.frame = Some(frame_receiver.try_iter().last().unwrap_or(frame));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if stop.is_stop_requested() {
                break;
            }

            if shared.reset_requested.swap(false, Ordering::AcqRel) {
                let live = pipeline.reset();
                tracing::info!(target: "wall_segmentation::thread", live, "pipeline reset");
                *shared.latest.lock() = None;
            }

            if mailbox.frame.is_none() {
                *shared.status.lock() = ThreadStatus::of(&pipeline);
                continue;
            }

            let outcome = pipeline.tick(Instant::now(), &mut mailbox);
            if stop.is_stop_requested() {
                break;
            }
            match outcome {
                TickOutcome::Processed { .. } | TickOutcome::Fallback => {
                    *shared.latest.lock() = pipeline.composite_frame();
                }
                TickOutcome::Failed(failure) => {
                    if pipeline.mode() == SchedulerMode::Fallback {
                        *shared.latest.lock() = pipeline.composite_frame();
                    }
                    tracing::debug!(target: "wall_segmentation::thread", "{}", failure);
                }
                TickOutcome::Skipped | TickOutcome::Discarded => {}
            }
            // A skipped frame is stale by the next tick.
            mailbox.frame = None;
            *shared.status.lock() = ThreadStatus::of(&pipeline);
        }

        shared.running.store(false, Ordering::Release);
        tracing::info!(target: "wall_segmentation::thread", "segmentation thread stopped");
    }

    /// Hand a frame to the pipeline without blocking
    ///
    /// Returns false if the frame was dropped because the queue is full or
    /// the thread has stopped.
    pub fn submit_frame(&self, frame: CameraFrame) -> bool {
        match &self.frame_sender {
            Some(sender) => sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Latest composite frame, if any was produced
    pub fn latest_frame(&self) -> Option<CompositeFrame> {
        self.latest.lock().clone()
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.lock().clone()
    }

    /// Ask the thread to leave fallback and resume live inference
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn fallback_signal(&self) -> FallbackSignal {
        self.fallback.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread; a run in progress completes but is not published
    pub fn stop(&mut self) {
        self.stop.request_stop();
        self.frame_sender.take();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!(
                    target: "wall_segmentation::thread",
                    "segmentation thread panicked"
                );
            }
        }
    }
}

impl Drop for SegmentationThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State the pipeline thread publishes into
struct Shared {
    latest: Arc<Mutex<Option<CompositeFrame>>>,
    status: Arc<Mutex<ThreadStatus>>,
    running: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticFrameSource;
    use crate::ml::{EngineRegistry, ModelCache};
    use crate::settings::PipelineSettings;

    fn spawn(settings: &PipelineSettings) -> SegmentationThread {
        let pipeline = SegmentationPipeline::build(
            settings,
            &EngineRegistry::with_builtin(),
            &mut ModelCache::new(),
        )
        .unwrap();
        SegmentationThread::spawn(pipeline).unwrap()
    }

    /// Feed frames until a composite frame shows up or time runs out
    fn pump(
        thread: &SegmentationThread,
        frames: &mut SyntheticFrameSource,
    ) -> Option<CompositeFrame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(frame) = frames.current_frame() {
                thread.submit_frame(frame);
            }
            if let Some(composite) = thread.latest_frame() {
                return Some(composite);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    fn small_settings() -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.model.input_width = 16;
        settings.model.input_height = 16;
        settings
    }

    #[test]
    fn test_thread_publishes_live_masks() {
        let mut thread = spawn(&small_settings());
        let mut frames = SyntheticFrameSource::new(24, 16, 2);
        assert!(thread.is_running());

        let composite = pump(&thread, &mut frames).expect("no mask published");
        assert!(!composite.is_fallback());
        assert_eq!(composite.mask.dimensions(), (24, 16));
        assert_eq!(thread.status().mode, SchedulerMode::Live);

        thread.stop();
        assert!(!thread.is_running());
        assert!(!thread.submit_frame(CameraFrame::solid(24, 16, [0, 0, 0, 255])));
    }

    #[test]
    fn test_thread_serves_demo_mask_in_fallback() {
        let mut settings = small_settings();
        settings.force_demo_mode = true;
        let thread = spawn(&settings);
        let mut frames = SyntheticFrameSource::new(20, 10, 2);

        let composite = pump(&thread, &mut frames).expect("no mask published");
        assert!(composite.is_fallback());
        assert!(thread.fallback_signal().is_active());
        assert_eq!(thread.status().mode, SchedulerMode::Fallback);
    }

    #[test]
    fn test_reset_request_keeps_forced_fallback() {
        let mut settings = small_settings();
        settings.force_demo_mode = true;
        let thread = spawn(&settings);
        thread.request_reset();

        let deadline = Instant::now() + Duration::from_secs(5);
        while thread.reset_requested.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!thread.reset_requested.load(Ordering::Acquire));
        assert!(thread.fallback_signal().is_active());
    }

    #[test]
    fn test_nothing_published_after_stop() {
        let mut thread = spawn(&small_settings());
        thread.stop();
        let mut frames = SyntheticFrameSource::new(8, 8, 1);
        for _ in 0..3 {
            assert!(!thread.submit_frame(frames.current_frame().unwrap()));
        }
        assert!(thread.latest_frame().is_none());
    }
}
