//! Inference engine traits and registry
//!
//! This module defines the seam between the pipeline and whatever runs the
//! neural network:
//! - `InferenceEngine` - Factory that turns a model artifact into a graph
//! - `ModelGraph` - A loaded model; declares its IO and creates runtimes
//! - `InferenceRuntime` - Backend-specific execution context for one worker
//!
//! Engines are selected by name through [`EngineRegistry`], never by
//! probing for types at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ModelArtifact, Tensor};
use crate::error::{BackendError, InferenceFailure, LoadError};

/// The compute substrate a worker runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    /// Synchronous CPU execution
    Cpu,
    /// GPU-like execution; may complete asynchronously
    #[default]
    Accelerated,
}

/// Name and dimensions of a declared model input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    /// `None` marks a dynamic dimension
    pub dims: Vec<Option<usize>>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dims: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }

    /// Info with every dimension fixed
    pub fn fixed(name: impl Into<String>, dims: &[usize]) -> Self {
        Self::new(name, dims.iter().copied().map(Some).collect())
    }
}

/// Factory trait for inference engines
pub trait InferenceEngine: Send + Sync {
    /// Unique identifier used in settings (e.g., "onnx")
    fn name(&self) -> &'static str;

    /// Parse an artifact into a loaded graph
    fn load_graph(&self, artifact: &ModelArtifact) -> Result<Arc<dyn ModelGraph>, LoadError>;
}

/// A loaded model, shared read-only between workers
pub trait ModelGraph: Send + Sync {
    /// Engine that produced this graph
    fn engine_name(&self) -> &'static str;

    /// Declared inputs
    fn inputs(&self) -> &[TensorInfo];

    /// Declared outputs
    fn outputs(&self) -> &[TensorInfo];

    /// Allocate an execution context on the given backend
    ///
    /// [`BackendError::Unsupported`] when this engine or device cannot provide
    /// the backend, [`BackendError::Initialization`] when allocation fails.
    fn create_runtime(
        &self,
        backend: ComputeBackend,
    ) -> Result<Box<dyn InferenceRuntime>, BackendError>;
}

/// Backend execution context owned by a single worker
pub trait InferenceRuntime: Send {
    /// Schedule a computation. May return before results are ready.
    fn submit(&mut self, input_name: &str, input: Tensor) -> Result<(), InferenceFailure>;

    /// Whether the last submitted computation has finished
    fn is_complete(&self) -> bool;

    /// Block until the last submitted computation finishes and take its outputs
    fn wait(&mut self) -> Result<Vec<(String, Tensor)>, InferenceFailure>;

    /// Release backend resources. Must tolerate repeated calls.
    fn release(&mut self);
}

/// Registry of available inference engines
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn InferenceEngine>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Registry with every engine compiled into this build
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::synthetic::SyntheticEngine::new());
        #[cfg(feature = "onnx")]
        registry.register(super::onnx::OnnxEngine::new());
        registry
    }

    /// Register an engine, replacing any engine with the same name
    pub fn register(&mut self, engine: impl InferenceEngine + 'static) {
        let name = engine.name().to_string();
        tracing::debug!(target: "wall_segmentation::engine", engine = %name, "engine registered");
        self.engines.insert(name, Arc::new(engine));
    }

    /// Get an engine by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn InferenceEngine>> {
        self.engines.get(name).cloned()
    }

    /// Get an engine by name or fail with [`LoadError::UnknownEngine`]
    pub fn require(&self, name: &str) -> Result<Arc<dyn InferenceEngine>, LoadError> {
        self.get(name)
            .ok_or_else(|| LoadError::UnknownEngine(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Registered engine names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockEngine;

    impl InferenceEngine for MockEngine {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn load_graph(&self, _artifact: &ModelArtifact) -> Result<Arc<dyn ModelGraph>, LoadError> {
            Err(LoadError::InvalidArtifact("mock engine loads nothing".into()))
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = EngineRegistry::new();
        assert!(registry.is_empty());
        registry.register(MockEngine);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("mock"));
        assert!(registry.get("mock").is_some());
        assert!(registry.get("onnx-missing").is_none());
    }

    #[test]
    fn test_require_unknown_engine() {
        let registry = EngineRegistry::new();
        match registry.require("nope") {
            Err(LoadError::UnknownEngine(name)) => assert_eq!(name, "nope"),
            _ => panic!("expected UnknownEngine"),
        }
    }

    #[test]
    fn test_builtin_contains_synthetic() {
        let registry = EngineRegistry::with_builtin();
        assert!(registry.names().contains(&"synthetic"));
    }

    #[test]
    fn test_backend_serde() {
        let backend: ComputeBackend = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(backend, ComputeBackend::Cpu);
        assert_eq!(ComputeBackend::default(), ComputeBackend::Accelerated);
    }
}
