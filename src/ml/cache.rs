//! Keyed cache of loaded models
//!
//! Owned by whoever builds pipelines and passed by reference, so separate
//! caches (and separate pipelines) never share state.
//!
//! Only the engine's graph is cached. The [`super::ModelSpec`] depends on
//! per-pipeline settings (input size, names, layout) and is resolved on
//! every lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::{InferenceEngine, ModelArtifact, ModelGraph, ModelHandle};
use crate::error::LoadError;
use crate::settings::ModelSettings;

/// Loaded graphs by key, with explicit invalidation
#[derive(Default)]
pub struct ModelCache {
    models: HashMap<String, Arc<dyn ModelGraph>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a handle on the cached graph for `key`, loading it on a miss
    pub fn get_or_load(
        &mut self,
        key: &str,
        engine: &dyn InferenceEngine,
        artifact: &ModelArtifact,
        settings: &ModelSettings,
    ) -> Result<ModelHandle, LoadError> {
        if let Some(graph) = self.models.get(key) {
            tracing::trace!(target: "wall_segmentation::cache", key, "model cache hit");
            return ModelHandle::from_graph(graph.clone(), settings);
        }

        let handle = ModelHandle::load(engine, artifact, settings)?;
        self.models.insert(key.to_string(), handle.graph().clone());
        tracing::debug!(
            target: "wall_segmentation::cache",
            key,
            cached = self.models.len(),
            "model cached"
        );
        Ok(handle)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ModelGraph>> {
        self.models.get(key).cloned()
    }

    /// Drop one entry. Workers already holding the handle keep it alive.
    pub fn invalidate(&mut self, key: &str) -> bool {
        let removed = self.models.remove(key).is_some();
        if removed {
            tracing::debug!(target: "wall_segmentation::cache", key, "model invalidated");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.models.clear();
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
