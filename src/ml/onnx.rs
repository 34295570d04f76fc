//! ONNX Runtime engine
//!
//! Loads `.onnx` artifacts through `ort`. The CPU runtime is always
//! available; the accelerated runtime registers the platform execution
//! provider (CoreML on macOS, DirectML on Windows, CUDA with the `cuda`
//! feature) and is reported unsupported when none applies.

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use ort::session::Session;

use super::{
    ComputeBackend, InferenceEngine, InferenceRuntime, ModelArtifact, ModelGraph, Tensor,
    TensorInfo, TensorLayout,
};
use crate::error::{BackendError, InferenceFailure, LoadError};

/// Engine backed by ONNX Runtime
#[derive(Debug, Default)]
pub struct OnnxEngine;

impl OnnxEngine {
    pub fn new() -> Self {
        // Only the first call configures the global environment.
        let _ = ort::init().with_name("WallSegmentation").commit();
        Self
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn load_graph(&self, artifact: &ModelArtifact) -> Result<Arc<dyn ModelGraph>, LoadError> {
        let bytes = artifact.read_bytes()?;
        let session = build_session(&bytes, ComputeBackend::Cpu)
            .map_err(|e| LoadError::InvalidArtifact(format!("onnx model: {}", e)))?;

        let inputs = session
            .inputs
            .iter()
            .map(|input| TensorInfo::new(input.name.clone(), dims_of(&input.input_type)))
            .collect();
        let outputs = session
            .outputs
            .iter()
            .map(|output| TensorInfo::new(output.name.clone(), dims_of(&output.output_type)))
            .collect();

        Ok(Arc::new(OnnxGraph {
            bytes: Arc::new(bytes),
            inputs,
            outputs,
        }))
    }
}

fn dims_of(value_type: &ort::value::ValueType) -> Vec<Option<usize>> {
    value_type
        .tensor_shape()
        .map(|shape| {
            shape
                .iter()
                .map(|&d| if d < 0 { None } else { Some(d as usize) })
                .collect()
        })
        .unwrap_or_default()
}

fn build_session(bytes: &[u8], backend: ComputeBackend) -> ort::Result<Session> {
    let builder = Session::builder()?.with_intra_threads(2)?;
    let builder = match backend {
        ComputeBackend::Cpu => builder,
        ComputeBackend::Accelerated => builder.with_execution_providers(accelerated_providers())?,
    };
    builder.commit_from_memory(bytes)
}

#[allow(unused_mut)]
fn accelerated_providers() -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
    let mut providers = Vec::new();
    #[cfg(feature = "cuda")]
    providers.push(
        ort::execution_providers::CUDAExecutionProvider::default()
            .build()
            .error_on_failure(),
    );
    #[cfg(target_os = "macos")]
    providers.push(
        ort::execution_providers::CoreMLExecutionProvider::default()
            .build()
            .error_on_failure(),
    );
    #[cfg(target_os = "windows")]
    providers.push(
        ort::execution_providers::DirectMLExecutionProvider::default()
            .build()
            .error_on_failure(),
    );
    providers
}

/// A parsed ONNX model; each runtime gets its own session
pub struct OnnxGraph {
    bytes: Arc<Vec<u8>>,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
}

impl ModelGraph for OnnxGraph {
    fn engine_name(&self) -> &'static str {
        "onnx"
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
        if backend == ComputeBackend::Accelerated && accelerated_providers().is_empty() {
            return Err(BackendError::Unsupported {
                engine: self.engine_name(),
                backend,
            });
        }
        let session = build_session(&self.bytes, backend).map_err(|e| {
            BackendError::Initialization(format!("failed to create ONNX session: {}", e))
        })?;
        Ok(Box::new(OnnxRuntime {
            session: Some(session),
            output_names: self.outputs.iter().map(|o| o.name.clone()).collect(),
            result: None,
        }))
    }
}

struct OnnxRuntime {
    session: Option<Session>,
    output_names: Vec<String>,
    result: Option<Result<Vec<(String, Tensor)>, InferenceFailure>>,
}

impl OnnxRuntime {
    fn run(
        session: &mut Session,
        output_names: &[String],
        input_name: &str,
        input: Tensor,
    ) -> Result<Vec<(String, Tensor)>, InferenceFailure> {
        let layout = input.layout();
        let shape = input.shape().to_vec();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), input.into_data())
            .map_err(|e| InferenceFailure::new(format!("failed to create input array: {}", e)))?;
        let value = ort::value::Tensor::from_array(array)
            .map_err(|e| InferenceFailure::new(format!("failed to create tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![input_name => value])
            .map_err(|e| InferenceFailure::new(e.to_string()))?;

        let mut collected = Vec::with_capacity(output_names.len());
        for name in output_names {
            let Some(output) = outputs.get(name.as_str()) else {
                continue;
            };
            let (shape, data) = output.try_extract_tensor::<f32>().map_err(|e| {
                InferenceFailure::new(format!("failed to extract '{}': {}", name, e))
            })?;
            let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            // ONNX carries no layout; rank 3 reads as CHW, rank 4 follows the
            // input. The worker applies `outputLayout` on top when configured.
            let out_layout = if shape.len() == 3 {
                TensorLayout::Chw
            } else {
                layout
            };
            collected.push((name.clone(), Tensor::new(shape, out_layout, data.to_vec())));
        }
        Ok(collected)
    }
}

impl InferenceRuntime for OnnxRuntime {
    fn submit(&mut self, input_name: &str, input: Tensor) -> Result<(), InferenceFailure> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| InferenceFailure::new("session released"))?;
        self.result = Some(Self::run(session, &self.output_names, input_name, input));
        Ok(())
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn wait(&mut self) -> Result<Vec<(String, Tensor)>, InferenceFailure> {
        self.result
            .take()
            .unwrap_or_else(|| Err(InferenceFailure::new("no run was submitted")))
    }

    fn release(&mut self) {
        self.session = None;
        self.result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_bytes_are_invalid_artifact() {
        let engine = OnnxEngine::new();
        let result = engine.load_graph(&ModelArtifact::Bytes(vec![0u8; 16]));
        assert!(result.is_err());
    }
}
