//! Model handles and specifications
//!
//! A [`ModelHandle`] pairs an engine's loaded graph with the immutable
//! [`ModelSpec`] the rest of the pipeline works from. Handles are cheap
//! to clone and may be shared by several workers.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{InferenceEngine, ModelGraph, TensorInfo, TensorLayout};
use crate::error::LoadError;
use crate::settings::ModelSettings;

/// Opaque model artifact, interpreted only by the engine
#[derive(Debug, Clone)]
pub enum ModelArtifact {
    /// In-memory blob
    Bytes(Vec<u8>),
    /// File on local storage (path resolution is the host's job)
    Path(PathBuf),
}

impl ModelArtifact {
    /// Read the whole artifact into memory
    pub fn read_bytes(&self) -> Result<Vec<u8>, LoadError> {
        match self {
            ModelArtifact::Bytes(bytes) => Ok(bytes.clone()),
            ModelArtifact::Path(path) => Ok(std::fs::read(path)?),
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            ModelArtifact::Bytes(bytes) => format!("<{} byte blob>", bytes.len()),
            ModelArtifact::Path(path) => path.display().to_string(),
        }
    }
}

/// Per-channel `(x - mean) / std` applied after scaling pixels to [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    /// ImageNet statistics, the usual choice for segmentation backbones
    pub fn imagenet() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }

    /// Mean and std for channel `c`; a single value applies to every channel
    pub fn channel(&self, c: usize) -> (f32, f32) {
        let pick = |values: &[f32], default: f32| {
            if values.len() == 1 {
                values[0]
            } else {
                values.get(c).copied().unwrap_or(default)
            }
        };
        (pick(&self.mean, 0.0), pick(&self.std, 1.0))
    }

    fn validate(&self, channels: usize) -> Result<(), LoadError> {
        for (label, values) in [("mean", &self.mean), ("std", &self.std)] {
            if values.len() != 1 && values.len() != channels {
                return Err(LoadError::InvalidArtifact(format!(
                    "normalization {} has {} values for {} channels",
                    label,
                    values.len(),
                    channels
                )));
            }
        }
        if self.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(LoadError::InvalidArtifact(
                "normalization std must be finite and non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// How raw output values map to class probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Outputs already are probabilities; clamp to [0, 1]
    #[default]
    Identity,
    /// Per-value logistic function
    Sigmoid,
    /// Softmax across the channel axis
    Softmax,
}

/// Input/output contract of a loaded model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub input_name: String,
    /// Fully resolved input shape in `layout` order
    pub input_shape: Vec<usize>,
    pub output_name: String,
    /// Declared output shape; dynamic dimensions are reported as 0
    pub output_shape: Vec<usize>,
    pub layout: TensorLayout,
    /// Overrides the layout the engine reports on the output tensor
    pub output_layout: Option<TensorLayout>,
    pub normalization: Option<Normalization>,
    pub activation: Activation,
}

impl ModelSpec {
    /// `(channels, height, width)` of the model input
    pub fn input_dims(&self) -> (usize, usize, usize) {
        self.layout
            .split_dims(&self.input_shape)
            .unwrap_or((0, 0, 0))
    }
}

struct ModelInner {
    spec: ModelSpec,
    graph: Arc<dyn ModelGraph>,
}

/// Loaded model reference plus its spec
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<ModelInner>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("engine", &self.inner.graph.engine_name())
            .field("spec", &self.inner.spec)
            .finish()
    }
}

impl ModelHandle {
    /// Load an artifact and validate it against the configured model settings
    pub fn load(
        engine: &dyn InferenceEngine,
        artifact: &ModelArtifact,
        settings: &ModelSettings,
    ) -> Result<Self, LoadError> {
        let graph = engine.load_graph(artifact)?;
        tracing::info!(
            target: "wall_segmentation::model",
            engine = engine.name(),
            artifact = %artifact.describe(),
            "model loaded"
        );
        Self::from_graph(graph, settings)
    }

    /// Bind an already loaded graph to the spec these settings describe
    pub fn from_graph(
        graph: Arc<dyn ModelGraph>,
        settings: &ModelSettings,
    ) -> Result<Self, LoadError> {
        let spec = build_spec(graph.as_ref(), settings)?;
        tracing::debug!(
            target: "wall_segmentation::model",
            engine = graph.engine_name(),
            input = %spec.input_name,
            input_shape = ?spec.input_shape,
            output = %spec.output_name,
            output_shape = ?spec.output_shape,
            layout = ?spec.layout,
            "model spec resolved"
        );
        Ok(Self {
            inner: Arc::new(ModelInner { spec, graph }),
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.inner.spec
    }

    pub fn graph(&self) -> &Arc<dyn ModelGraph> {
        &self.inner.graph
    }

    pub fn engine_name(&self) -> &'static str {
        self.inner.graph.engine_name()
    }

    /// Whether two handles share one loaded graph
    pub fn shares_graph(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.inner.graph, &other.inner.graph)
    }
}

fn find<'a>(infos: &'a [TensorInfo], name: &str, kind: &str) -> Result<&'a TensorInfo, LoadError> {
    infos.iter().find(|info| info.name == name).ok_or_else(|| {
        let declared: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        LoadError::InvalidArtifact(format!(
            "model declares no {} named '{}' (declared: {:?})",
            kind, name, declared
        ))
    })
}

fn build_spec(graph: &dyn ModelGraph, settings: &ModelSettings) -> Result<ModelSpec, LoadError> {
    let layout = settings.layout;
    let input = find(graph.inputs(), &settings.input_name, "input")?;
    let output = find(graph.outputs(), &settings.output_name, "output")?;

    if input.dims.len() != layout.rank() {
        return Err(LoadError::InvalidArtifact(format!(
            "input '{}' has rank {} but layout {:?} needs rank {}",
            input.name,
            input.dims.len(),
            layout,
            layout.rank()
        )));
    }

    // Dynamic axes: batch 1, channels RGB, spatial dims from settings.
    let (c_axis, h_axis, w_axis) = match layout {
        TensorLayout::Nchw => (1, 2, 3),
        TensorLayout::Nhwc => (3, 1, 2),
        TensorLayout::Chw => (0, 1, 2),
    };
    let input_shape: Vec<usize> = input
        .dims
        .iter()
        .enumerate()
        .map(|(axis, dim)| {
            dim.unwrap_or(if axis == c_axis {
                3
            } else if axis == h_axis {
                settings.input_height as usize
            } else if axis == w_axis {
                settings.input_width as usize
            } else {
                1
            })
        })
        .collect();

    let (channels, height, width) = layout
        .split_dims(&input_shape)
        .ok_or_else(|| LoadError::InvalidArtifact("input shape does not match layout".into()))?;

    if !matches!(channels, 1 | 3 | 4) {
        return Err(LoadError::InvalidArtifact(format!(
            "input '{}' expects {} channels; only 1, 3 or 4 are supported",
            input.name, channels
        )));
    }
    if height == 0 || width == 0 {
        return Err(LoadError::InvalidArtifact(format!(
            "input '{}' has empty spatial size {}x{}",
            input.name, width, height
        )));
    }

    if let Some(normalization) = &settings.normalization {
        normalization.validate(channels)?;
    }

    Ok(ModelSpec {
        input_name: input.name.clone(),
        input_shape,
        output_name: output.name.clone(),
        output_shape: output.dims.iter().map(|d| d.unwrap_or(0)).collect(),
        layout,
        output_layout: settings.output_layout,
        normalization: settings.normalization.clone(),
        activation: settings.activation,
    })
}
