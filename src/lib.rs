//! Wall Segmentation Library
//!
//! Live wall segmentation for paint overlays: camera frames are run through
//! a segmentation model at an adaptive rate, the wall class is extracted,
//! and masks are stabilized over time before they reach the compositor.
//! When inference is unavailable or keeps failing, a static demo mask is
//! served instead.

pub mod camera;
pub mod compositor;
pub mod error;
pub mod ml;
pub mod pipeline;
pub mod scheduler;
pub mod segmentation;
pub mod settings;
pub mod telemetry;

pub use camera::{CameraFrame, FrameSource, StillImageSource, SyntheticFrameSource};
pub use compositor::{
    threshold_for_display, BinaryMask, CompositeFrame, CompositorParams, CompositorUniforms,
};
pub use error::{BackendError, InferenceFailure, LoadError, ShapeMismatchError, WorkerError};
pub use ml::{
    ComputeBackend, EngineRegistry, ModelCache, ModelHandle, Tensor, TensorLayout, Worker,
};
pub use pipeline::{
    FallbackSignal, MaskSource, SegmentationPipeline, SegmentationThread, StopHandle,
    ThreadStatus, TickOutcome,
};
pub use scheduler::{AdaptiveScheduler, SchedulerMode, SchedulerState};
pub use segmentation::{extract, preprocess, Mask, MaskExtractor, MaskHistory};
pub use settings::PipelineSettings;
