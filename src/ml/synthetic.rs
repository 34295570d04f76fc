//! Synthetic inference engine
//!
//! A deterministic stand-in for a segmentation network, used when no real
//! model is configured and throughout the tests. The artifact is a small
//! JSON manifest declaring the model's inputs and outputs:
//!
//! ```json
//! {
//!   "inputs": [{ "name": "image", "dims": [1, 3, null, null] }],
//!   "outputs": [{ "name": "predict", "dims": [1, 10, null, null] }],
//!   "layout": "NCHW",
//!   "wallClass": 9,
//!   "accelerated": true,
//!   "latencyMs": 0
//! }
//! ```
//!
//! The wall-class probability of an output pixel is the mean channel
//! intensity of the nearest input pixel; every other channel holds its
//! complement. Dynamic output dimensions follow the input.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::{
    ComputeBackend, InferenceEngine, InferenceRuntime, ModelArtifact, ModelGraph, Tensor,
    TensorInfo, TensorLayout,
};
use crate::error::{BackendError, InferenceFailure, LoadError};

/// Declared IO and behaviour of a synthetic model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyntheticManifest {
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    /// Layout the declared input dims are written in
    pub layout: TensorLayout,
    /// Output channel carrying the wall probability
    pub wall_class: usize,
    /// Whether an accelerated runtime is offered
    pub accelerated: bool,
    /// Artificial per-run latency
    pub latency_ms: u64,
}

impl Default for SyntheticManifest {
    fn default() -> Self {
        Self {
            inputs: vec![TensorInfo::new(
                "image",
                vec![Some(1), Some(3), None, None],
            )],
            outputs: vec![TensorInfo::new(
                "predict",
                vec![Some(1), Some(10), None, None],
            )],
            layout: TensorLayout::Nchw,
            wall_class: 9,
            accelerated: true,
            latency_ms: 0,
        }
    }
}

impl SyntheticManifest {
    /// Encode as an in-memory artifact
    pub fn to_artifact(&self) -> ModelArtifact {
        ModelArtifact::Bytes(serde_json::to_vec_pretty(self).unwrap_or_default())
    }

    fn validate(&self) -> Result<(), LoadError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(LoadError::InvalidArtifact(
                "synthetic manifest needs at least one input and one output".into(),
            ));
        }
        for output in &self.outputs {
            if !(2..=4).contains(&output.dims.len()) {
                return Err(LoadError::InvalidArtifact(format!(
                    "synthetic output '{}' has rank {}; expected 2, 3 or 4",
                    output.name,
                    output.dims.len()
                )));
            }
        }
        Ok(())
    }
}

/// Engine producing [`SyntheticGraph`]s from JSON manifests
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticEngine;

impl SyntheticEngine {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceEngine for SyntheticEngine {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn load_graph(&self, artifact: &ModelArtifact) -> Result<Arc<dyn ModelGraph>, LoadError> {
        let bytes = artifact.read_bytes()?;
        let manifest: SyntheticManifest = serde_json::from_slice(&bytes)
            .map_err(|e| LoadError::InvalidArtifact(format!("bad synthetic manifest: {}", e)))?;
        manifest.validate()?;
        Ok(Arc::new(SyntheticGraph {
            manifest: Arc::new(manifest),
        }))
    }
}

/// A loaded synthetic model
pub struct SyntheticGraph {
    manifest: Arc<SyntheticManifest>,
}

impl ModelGraph for SyntheticGraph {
    fn engine_name(&self) -> &'static str {
        "synthetic"
    }

    fn inputs(&self) -> &[TensorInfo] {
        &self.manifest.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.manifest.outputs
    }

    fn create_runtime(
        &self,
        backend: ComputeBackend,
    ) -> Result<Box<dyn InferenceRuntime>, BackendError> {
        match backend {
            ComputeBackend::Cpu => Ok(Box::new(CpuRuntime {
                manifest: self.manifest.clone(),
                result: None,
            })),
            ComputeBackend::Accelerated if self.manifest.accelerated => {
                let runtime = AcceleratedRuntime::spawn(self.manifest.clone()).map_err(|e| {
                    BackendError::Initialization(format!(
                        "failed to spawn accelerated runtime: {}",
                        e
                    ))
                })?;
                Ok(Box::new(runtime))
            }
            ComputeBackend::Accelerated => Err(BackendError::Unsupported {
                engine: self.engine_name(),
                backend,
            }),
        }
    }
}

type RunResult = Result<Vec<(String, Tensor)>, InferenceFailure>;

struct Job {
    input_name: String,
    input: Tensor,
}

/// Runs the model inside `submit`
struct CpuRuntime {
    manifest: Arc<SyntheticManifest>,
    result: Option<RunResult>,
}

impl InferenceRuntime for CpuRuntime {
    fn submit(&mut self, input_name: &str, input: Tensor) -> Result<(), InferenceFailure> {
        check_input(&self.manifest, input_name, &input)?;
        self.result = Some(run(&self.manifest, &input));
        Ok(())
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn wait(&mut self) -> RunResult {
        self.result
            .take()
            .unwrap_or_else(|| Err(InferenceFailure::new("no run was submitted")))
    }

    fn release(&mut self) {
        self.result = None;
    }
}

/// Runs the model on a dedicated thread
struct AcceleratedRuntime {
    manifest: Arc<SyntheticManifest>,
    jobs: Option<Sender<Job>>,
    results: Receiver<RunResult>,
    pending: bool,
    thread: Option<JoinHandle<()>>,
}

impl AcceleratedRuntime {
    fn spawn(manifest: Arc<SyntheticManifest>) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<Job>(1);
        let (result_tx, result_rx) = bounded::<RunResult>(1);
        let worker_manifest = manifest.clone();

        let thread = std::thread::Builder::new()
            .name("synthetic-accelerated".into())
            .spawn(move || {
                for job in job_rx.iter() {
                    let result = run(&worker_manifest, &job.input);
                    tracing::trace!(
                        target: "wall_segmentation::synthetic",
                        input = %job.input_name,
                        ok = result.is_ok(),
                        "accelerated run finished"
                    );
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            manifest,
            jobs: Some(job_tx),
            results: result_rx,
            pending: false,
            thread: Some(thread),
        })
    }
}

impl InferenceRuntime for AcceleratedRuntime {
    fn submit(&mut self, input_name: &str, input: Tensor) -> Result<(), InferenceFailure> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| InferenceFailure::new("runtime released"))?;
        if self.pending {
            return Err(InferenceFailure::new("a run is already pending"));
        }
        check_input(&self.manifest, input_name, &input)?;
        jobs.send(Job {
            input_name: input_name.to_string(),
            input,
        })
        .map_err(|_| InferenceFailure::new("accelerated thread stopped"))?;
        self.pending = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        !self.pending || !self.results.is_empty()
    }

    fn wait(&mut self) -> RunResult {
        if !self.pending {
            return Err(InferenceFailure::new("no run was submitted"));
        }
        self.pending = false;
        self.results
            .recv()
            .map_err(|_| InferenceFailure::new("accelerated thread stopped"))?
    }

    fn release(&mut self) {
        // Closing the job channel ends the thread's loop.
        self.jobs = None;
        self.pending = false;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AcceleratedRuntime {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_input(
    manifest: &SyntheticManifest,
    input_name: &str,
    input: &Tensor,
) -> Result<(), InferenceFailure> {
    if !manifest.inputs.iter().any(|info| info.name == input_name) {
        return Err(InferenceFailure::new(format!(
            "unknown input '{}'",
            input_name
        )));
    }
    if !input.is_consistent() {
        return Err(InferenceFailure::new(format!(
            "input shape {:?} needs {} values but holds {}",
            input.shape(),
            input.numel(),
            input.data().len()
        )));
    }
    if input.layout().split_dims(input.shape()).is_none() {
        return Err(InferenceFailure::new(format!(
            "input shape {:?} does not match layout {:?}",
            input.shape(),
            input.layout()
        )));
    }
    Ok(())
}

fn run(manifest: &SyntheticManifest, input: &Tensor) -> RunResult {
    if manifest.latency_ms > 0 {
        std::thread::sleep(Duration::from_millis(manifest.latency_ms));
    }

    let (channels, in_h, in_w) = input
        .layout()
        .split_dims(input.shape())
        .ok_or_else(|| InferenceFailure::new("input rank does not match its layout"))?;
    if channels == 0 || in_h == 0 || in_w == 0 {
        return Err(InferenceFailure::new("empty input tensor"));
    }

    let data = input.data();
    let value_at = |c: usize, y: usize, x: usize| match input.layout() {
        TensorLayout::Nchw | TensorLayout::Chw => data[(c * in_h + y) * in_w + x],
        TensorLayout::Nhwc => data[(y * in_w + x) * channels + c],
    };

    let mut intensity = vec![0.0f32; in_h * in_w];
    for y in 0..in_h {
        for x in 0..in_w {
            let sum: f32 = (0..channels).map(|c| value_at(c, y, x)).sum();
            intensity[y * in_w + x] = sum / channels as f32;
        }
    }

    let outputs = manifest
        .outputs
        .iter()
        .map(|info| {
            let tensor = render_output(info, manifest.wall_class, &intensity, in_h, in_w);
            (info.name.clone(), tensor)
        })
        .collect();
    Ok(outputs)
}

fn render_output(
    info: &TensorInfo,
    wall_class: usize,
    intensity: &[f32],
    in_h: usize,
    in_w: usize,
) -> Tensor {
    let rank = info.dims.len();
    let dim = |i: usize, default: usize| info.dims[i].unwrap_or(default);
    let (shape, channels, out_h, out_w) = match rank {
        2 => {
            let (h, w) = (dim(0, in_h), dim(1, in_w));
            (vec![h, w], 1, h, w)
        }
        3 => {
            let (c, h, w) = (dim(0, wall_class + 1), dim(1, in_h), dim(2, in_w));
            (vec![c, h, w], c, h, w)
        }
        _ => {
            let (c, h, w) = (dim(1, wall_class + 1), dim(2, in_h), dim(3, in_w));
            (vec![1, c, h, w], c, h, w)
        }
    };

    let plane = out_h * out_w;
    let mut data = vec![0.0f32; channels * plane];
    for y in 0..out_h {
        let sy = (y * in_h / out_h.max(1)).min(in_h - 1);
        for x in 0..out_w {
            let sx = (x * in_w / out_w.max(1)).min(in_w - 1);
            let p = intensity[sy * in_w + sx];
            for c in 0..channels {
                data[c * plane + y * out_w + x] = if channels == 1 || c == wall_class {
                    p
                } else {
                    1.0 - p
                };
            }
        }
    }

    let layout = if rank == 3 {
        TensorLayout::Chw
    } else {
        TensorLayout::Nchw
    };
    Tensor::new(shape, layout, data)
}
