//! Inference worker
//!
//! A worker owns one backend runtime and runs at most one inference at a
//! time. `execute` may return before the backend has finished;
//! `fetch_output` is the synchronization barrier that makes results visible
//! on the CPU.

use std::time::Instant;

use super::{ComputeBackend, InferenceRuntime, ModelHandle, ModelSpec, Tensor};
use crate::error::{BackendError, WorkerError};

/// Receipt for a scheduled inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInference {
    id: u64,
    backend: ComputeBackend,
    submitted_at: Instant,
}

impl PendingInference {
    /// Sequence number of the run on its worker, starting at 1
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

/// Executes a loaded model on one compute backend
pub struct Worker {
    model: ModelHandle,
    runtime: Option<Box<dyn InferenceRuntime>>,
    backend: ComputeBackend,
    requested: ComputeBackend,
    degraded: Option<String>,
    in_flight: Option<u64>,
    resolved: Option<Vec<(String, Tensor)>>,
    runs: u64,
}

impl Worker {
    /// Allocate an execution context, falling back to CPU when the requested
    /// accelerated backend is unavailable
    pub fn create(model: &ModelHandle, requested: ComputeBackend) -> Result<Self, BackendError> {
        let graph = model.graph();
        let engine = graph.engine_name();

        let (runtime, backend, degraded) = match graph.create_runtime(requested) {
            Ok(runtime) => (runtime, requested, None),
            Err(e) if requested != ComputeBackend::Cpu => {
                let runtime = graph.create_runtime(ComputeBackend::Cpu)?;
                let reason = format!("{}, running on CPU", e);
                tracing::warn!(
                    target: "wall_segmentation::worker",
                    engine,
                    requested = ?requested,
                    "{}",
                    reason
                );
                (runtime, ComputeBackend::Cpu, Some(reason))
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            target: "wall_segmentation::worker",
            engine,
            backend = ?backend,
            "worker created"
        );

        Ok(Self {
            model: model.clone(),
            runtime: Some(runtime),
            backend,
            requested,
            degraded,
            in_flight: None,
            resolved: None,
            runs: 0,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        self.model.spec()
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Backend actually in use
    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    /// Backend the caller asked for
    pub fn requested_backend(&self) -> ComputeBackend {
        self.requested
    }

    /// Why the worker runs on a lesser backend than requested, if it does
    pub fn degraded(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.runtime.is_none()
    }

    /// Whether a run has been scheduled and its outputs not yet collected
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether the scheduled run has finished on the backend
    pub fn is_complete(&self) -> bool {
        match (&self.runtime, self.in_flight) {
            (Some(runtime), Some(_)) => runtime.is_complete(),
            _ => true,
        }
    }

    /// Schedule a run of the model on `input`
    ///
    /// Any outputs of the previous run that were not fetched are dropped.
    pub fn execute(&mut self, input: Tensor) -> Result<PendingInference, WorkerError> {
        let runtime = self.runtime.as_mut().ok_or(WorkerError::Disposed)?;
        if self.in_flight.is_some() {
            return Err(WorkerError::Busy);
        }
        self.resolved = None;

        runtime.submit(&self.model.spec().input_name, input)?;

        self.runs += 1;
        self.in_flight = Some(self.runs);
        Ok(PendingInference {
            id: self.runs,
            backend: self.backend,
            submitted_at: Instant::now(),
        })
    }

    /// Take the named output of the last run, blocking until it is available
    pub fn fetch_output(&mut self, name: &str) -> Result<Tensor, WorkerError> {
        self.check_output_name(name)?;
        let runtime = self.runtime.as_mut().ok_or(WorkerError::Disposed)?;

        if self.in_flight.take().is_some() {
            // Barrier: the backend result becomes CPU-visible here.
            self.resolved = Some(runtime.wait()?);
        }

        let outputs = self.resolved.as_mut().ok_or(WorkerError::NotReady)?;
        let index = outputs
            .iter()
            .position(|(output, _)| output == name)
            .ok_or_else(|| WorkerError::UnknownOutput(name.to_string()))?;
        let tensor = outputs.swap_remove(index).1;

        let spec = self.model.spec();
        match spec.output_layout {
            Some(layout) if spec.output_name == name => Ok(tensor.with_layout(layout)),
            _ => Ok(tensor),
        }
    }

    /// Non-blocking [`Worker::fetch_output`]; `NotReady` while the backend
    /// is still computing
    pub fn try_fetch_output(&mut self, name: &str) -> Result<Tensor, WorkerError> {
        if self.in_flight.is_some() && !self.is_complete() {
            return Err(WorkerError::NotReady);
        }
        self.fetch_output(name)
    }

    /// Release the backend runtime. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            runtime.release();
            self.in_flight = None;
            self.resolved = None;
            tracing::debug!(
                target: "wall_segmentation::worker",
                engine = self.model.engine_name(),
                runs = self.runs,
                "worker disposed"
            );
        }
    }

    fn check_output_name(&self, name: &str) -> Result<(), WorkerError> {
        let declared = self
            .model
            .graph()
            .outputs()
            .iter()
            .any(|info| info.name == name);
        if declared {
            Ok(())
        } else {
            Err(WorkerError::UnknownOutput(name.to_string()))
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceFailure;
    use crate::ml::synthetic::{SyntheticEngine, SyntheticManifest};
    use crate::ml::{InferenceEngine, ModelArtifact, ModelGraph, TensorInfo, TensorLayout};
    use crate::settings::ModelSettings;
    use std::sync::Arc;

    fn synthetic_handle(accelerated: bool) -> ModelHandle {
        let manifest = SyntheticManifest {
            accelerated,
            ..SyntheticManifest::default()
        };
        let settings = ModelSettings {
            input_width: 8,
            input_height: 8,
            ..ModelSettings::default()
        };
        ModelHandle::load(&SyntheticEngine::new(), &manifest.to_artifact(), &settings).unwrap()
    }

    fn input_for(worker: &Worker) -> Tensor {
        let spec = worker.spec();
        Tensor::new(
            spec.input_shape.clone(),
            spec.layout,
            vec![0.5; spec.input_shape.iter().product()],
        )
    }

    #[test]
    fn test_fetch_before_execute_is_not_ready() {
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        assert!(matches!(
            worker.fetch_output("predict"),
            Err(WorkerError::NotReady)
        ));
    }

    #[test]
    fn test_execute_then_fetch_on_cpu() {
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        let input = input_for(&worker);
        let pending = worker.execute(input).unwrap();
        assert_eq!(pending.id(), 1);
        assert_eq!(pending.backend(), ComputeBackend::Cpu);

        let output = worker.fetch_output("predict").unwrap();
        assert_eq!(output.shape(), &[1, 10, 8, 8]);

        // Output was moved out; a second fetch has nothing to return
        assert!(worker.fetch_output("predict").is_err());
    }

    #[test]
    fn test_accelerated_runs_asynchronously() {
        let mut worker =
            Worker::create(&synthetic_handle(true), ComputeBackend::Accelerated).unwrap();
        assert_eq!(worker.backend(), ComputeBackend::Accelerated);
        assert!(worker.degraded().is_none());

        let input = input_for(&worker);
        worker.execute(input).unwrap();
        assert!(worker.is_in_flight());
        let output = worker.fetch_output("predict").unwrap();
        assert!(output.is_consistent());
        assert!(!worker.is_in_flight());
    }

    #[test]
    fn test_falls_back_to_cpu_when_accelerated_unavailable() {
        let worker = Worker::create(&synthetic_handle(false), ComputeBackend::Accelerated).unwrap();
        assert_eq!(worker.backend(), ComputeBackend::Cpu);
        assert_eq!(worker.requested_backend(), ComputeBackend::Accelerated);
        assert!(worker.degraded().unwrap().contains("running on CPU"));
    }

    #[test]
    fn test_configured_output_layout_relabels_output() {
        let settings = ModelSettings {
            input_width: 8,
            input_height: 8,
            output_layout: Some(TensorLayout::Nhwc),
            ..ModelSettings::default()
        };
        let artifact = SyntheticManifest::default().to_artifact();
        let handle = ModelHandle::load(&SyntheticEngine::new(), &artifact, &settings).unwrap();
        let mut worker = Worker::create(&handle, ComputeBackend::Cpu).unwrap();
        worker.execute(input_for(&worker)).unwrap();
        let output = worker.fetch_output("predict").unwrap();
        assert_eq!(output.layout(), TensorLayout::Nhwc);
        assert_eq!(output.shape(), &[1, 10, 8, 8]);

        // Without the setting the engine's label stands
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        worker.execute(input_for(&worker)).unwrap();
        assert_eq!(worker.fetch_output("predict").unwrap().layout(), TensorLayout::Nchw);
    }

    #[test]
    fn test_second_execute_while_in_flight_is_busy() {
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        worker.execute(input_for(&worker)).unwrap();
        let second = worker.execute(input_for(&worker));
        assert!(matches!(second, Err(WorkerError::Busy)));
    }

    #[test]
    fn test_unknown_output_name() {
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        worker.execute(input_for(&worker)).unwrap();
        assert!(matches!(
            worker.fetch_output("logits"),
            Err(WorkerError::UnknownOutput(name)) if name == "logits"
        ));
    }

    #[test]
    fn test_try_fetch_resolves_after_completion() {
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        worker.execute(input_for(&worker)).unwrap();
        // CPU runtime completes inside submit
        assert!(worker.is_complete());
        assert!(worker.try_fetch_output("predict").is_ok());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut worker =
            Worker::create(&synthetic_handle(true), ComputeBackend::Accelerated).unwrap();
        worker.dispose();
        worker.dispose();
        assert!(worker.is_disposed());
        let input = Tensor::zeros(vec![1, 3, 8, 8], TensorLayout::Nchw);
        assert!(matches!(worker.execute(input), Err(WorkerError::Disposed)));
    }

    struct NoRuntimeGraph {
        inputs: Vec<TensorInfo>,
        outputs: Vec<TensorInfo>,
        allocation_fails: bool,
    }

    impl ModelGraph for NoRuntimeGraph {
        fn engine_name(&self) -> &'static str {
            "none"
        }
        fn inputs(&self) -> &[TensorInfo] {
            &self.inputs
        }
        fn outputs(&self) -> &[TensorInfo] {
            &self.outputs
        }
        fn create_runtime(
            &self,
            backend: ComputeBackend,
        ) -> Result<Box<dyn InferenceRuntime>, BackendError> {
            if self.allocation_fails {
                return Err(BackendError::Initialization(format!(
                    "{:?} device out of memory",
                    backend
                )));
            }
            Err(BackendError::Unsupported {
                engine: "none",
                backend,
            })
        }
    }

    struct NoRuntimeEngine {
        allocation_fails: bool,
    }

    impl InferenceEngine for NoRuntimeEngine {
        fn name(&self) -> &'static str {
            "none"
        }
        fn load_graph(
            &self,
            _artifact: &ModelArtifact,
        ) -> Result<Arc<dyn ModelGraph>, crate::error::LoadError> {
            Ok(Arc::new(NoRuntimeGraph {
                inputs: vec![TensorInfo::fixed("image", &[1, 3, 4, 4])],
                outputs: vec![TensorInfo::fixed("predict", &[1, 1, 4, 4])],
                allocation_fails: self.allocation_fails,
            }))
        }
    }

    fn no_runtime_handle(allocation_fails: bool) -> ModelHandle {
        ModelHandle::load(
            &NoRuntimeEngine { allocation_fails },
            &ModelArtifact::Bytes(Vec::new()),
            &ModelSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_no_backend_at_all_is_backend_error() {
        let handle = no_runtime_handle(false);
        let result = Worker::create(&handle, ComputeBackend::Accelerated);
        assert!(matches!(
            result,
            Err(BackendError::Unsupported {
                backend: ComputeBackend::Cpu,
                ..
            })
        ));
    }

    #[test]
    fn test_failed_allocation_is_initialization_error() {
        let handle = no_runtime_handle(true);
        let result = Worker::create(&handle, ComputeBackend::Accelerated);
        assert!(matches!(
            result,
            Err(BackendError::Initialization(msg)) if msg.contains("Cpu")
        ));
        let result = Worker::create(&handle, ComputeBackend::Cpu);
        assert!(matches!(result, Err(BackendError::Initialization(_))));
    }

    #[test]
    fn test_inference_failure_propagates() {
        let mut worker = Worker::create(&synthetic_handle(false), ComputeBackend::Cpu).unwrap();
        // Wrong shape for the declared input
        let bad = Tensor::new(vec![1, 3, 8, 8], TensorLayout::Nchw, vec![0.0; 5]);
        let err = worker.execute(bad).unwrap_err();
        let failure: InferenceFailure = err.into();
        assert!(!failure.message.is_empty());
        assert!(!worker.is_in_flight());
    }
}
