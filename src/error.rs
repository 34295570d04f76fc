//! Error types for the segmentation pipeline
//!
//! Only [`LoadError`] is fatal: it stops a pipeline from being built.
//! Every other error is recovered inside the stage that produced it
//! (CPU fallback, all-zero masks, scheduler error counting).

use thiserror::Error;

use crate::ml::ComputeBackend;

/// Bad or missing model artifact
#[derive(Debug, Error)]
pub enum LoadError {
    /// The artifact could not be parsed or does not match the configured model
    #[error("invalid model artifact: {0}")]
    InvalidArtifact(String),
    /// No engine with this name is registered
    #[error("no inference engine registered as '{0}'")]
    UnknownEngine(String),
    /// The artifact file could not be read
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// No usable compute backend for a model
#[derive(Debug, Error)]
pub enum BackendError {
    /// Neither the requested backend nor the CPU fallback is available
    #[error("engine '{engine}' cannot run on the {backend:?} backend")]
    Unsupported {
        engine: &'static str,
        backend: ComputeBackend,
    },
    /// The backend exists but failed to allocate its execution context
    #[error("backend initialization failed: {0}")]
    Initialization(String),
}

/// A failure while a backend executes the model
#[derive(Debug, Clone, Error)]
#[error("inference failed: {message}")]
pub struct InferenceFailure {
    pub message: String,
}

impl InferenceFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors surfaced by a [`crate::ml::Worker`]
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Output was requested before a computation was scheduled or finished
    #[error("output polled before the backend finished")]
    NotReady,
    /// A computation is already in flight on this worker
    #[error("an inference is already in flight")]
    Busy,
    /// The model has no output with this name
    #[error("model has no output named '{0}'")]
    UnknownOutput(String),
    /// The worker was disposed
    #[error("worker has been disposed")]
    Disposed,
    #[error(transparent)]
    Inference(#[from] InferenceFailure),
}

/// Tensor dimensions don't match what a stage expected
#[derive(Debug, Clone, Error)]
#[error("tensor shape {shape:?} needs {expected} values but holds {actual}")]
pub struct ShapeMismatchError {
    pub shape: Vec<usize>,
    pub expected: usize,
    pub actual: usize,
}

impl From<WorkerError> for InferenceFailure {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Inference(failure) => failure,
            other => InferenceFailure::new(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_into_failure_keeps_message() {
        let failure: InferenceFailure =
            WorkerError::Inference(InferenceFailure::new("device lost")).into();
        assert_eq!(failure.message, "device lost");

        let failure: InferenceFailure = WorkerError::NotReady.into();
        assert!(failure.message.contains("polled"));
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Unsupported {
            engine: "synthetic",
            backend: ComputeBackend::Cpu,
        };
        assert_eq!(
            err.to_string(),
            "engine 'synthetic' cannot run on the Cpu backend"
        );
    }
}
