//! Model loading and inference execution
//!
//! The pipeline never talks to a neural-network runtime directly. Instead:
//! - An [`InferenceEngine`] parses a [`ModelArtifact`] into a [`ModelGraph`]
//! - A [`ModelHandle`] validates the graph against the configured model
//! - A [`Worker`] owns one backend runtime and runs one inference at a time
//!
//! The synthetic engine is always compiled in. The ONNX Runtime engine is
//! behind the `onnx` feature.

mod cache;
mod engine;
mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod synthetic;
mod tensor;
mod worker;

pub use cache::ModelCache;
pub use engine::{
    ComputeBackend, EngineRegistry, InferenceEngine, InferenceRuntime, ModelGraph, TensorInfo,
};
pub use model::{Activation, ModelArtifact, ModelHandle, ModelSpec, Normalization};
pub use tensor::{Tensor, TensorLayout};
pub use worker::{PendingInference, Worker};
