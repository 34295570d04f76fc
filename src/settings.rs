//! Pipeline settings
//!
//! Loaded from JSON. Every field has a default, so a partial file (or no
//! file at all) yields a working pipeline configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compositor::CompositorParams;
use crate::ml::{Activation, ComputeBackend, Normalization, TensorLayout};

/// Model and mask extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    /// Model artifact on local storage; the built-in synthetic model when unset
    pub path: Option<PathBuf>,
    /// Registered engine name
    pub engine: String,
    pub input_name: String,
    pub output_name: String,
    pub layout: TensorLayout,
    /// Layout of the output tensor when the engine can't tell on its own
    pub output_layout: Option<TensorLayout>,
    /// Used when the model declares a dynamic width
    pub input_width: u32,
    /// Used when the model declares a dynamic height
    pub input_height: u32,
    pub normalization: Option<Normalization>,
    pub activation: Activation,
    /// Output channel holding the wall class
    pub wall_class_index: usize,
    /// Display threshold carried on extracted masks
    pub threshold: f32,
    pub backend: ComputeBackend,
    /// Key for the model cache; defaults to the path
    pub cache_key: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: None,
            engine: "synthetic".to_string(),
            input_name: "image".to_string(),
            output_name: "predict".to_string(),
            layout: TensorLayout::Nchw,
            output_layout: None,
            input_width: 128,
            input_height: 128,
            normalization: None,
            activation: Activation::Identity,
            wall_class_index: 9,
            threshold: 0.3,
            backend: ComputeBackend::Accelerated,
            cache_key: None,
        }
    }
}

impl ModelSettings {
    /// Key identifying this model in a [`crate::ml::ModelCache`]
    pub fn cache_key(&self) -> String {
        if let Some(key) = &self.cache_key {
            return key.clone();
        }
        match &self.path {
            Some(path) => format!("{}:{}", self.engine, path.display()),
            None => format!("{}:builtin", self.engine),
        }
    }
}

/// Temporal stabilizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StabilizerSettings {
    /// History length K; 0 disables smoothing
    pub buffer_size: usize,
    /// Smoothing factor s in [0, 1]
    pub smoothing: f32,
}

impl Default for StabilizerSettings {
    fn default() -> Self {
        Self {
            buffer_size: 3,
            smoothing: 0.6,
        }
    }
}

/// Adaptive scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub initial_interval_secs: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    /// Target cost T of one chain run
    pub target_frame_budget_ms: f64,
    /// Consecutive failures before switching to fallback
    pub error_threshold: u32,
    /// Adjust the interval to measured durations
    pub adaptive: bool,
    /// Log a stats summary every this many runs (0 = never)
    pub stats_every_runs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_interval_secs: 0.3,
            min_interval_secs: 0.1,
            max_interval_secs: 2.0,
            target_frame_budget_ms: 30.0,
            error_threshold: 3,
            adaptive: true,
            stats_every_runs: 50,
        }
    }
}

impl SchedulerSettings {
    /// Repair the interval band: `0 < min <= initial <= max`, finite budget
    pub fn sanitize(&mut self) {
        if !(self.min_interval_secs > 0.0) || !self.min_interval_secs.is_finite() {
            self.min_interval_secs = Self::default().min_interval_secs;
        }
        if !(self.max_interval_secs >= self.min_interval_secs) {
            self.max_interval_secs = self.min_interval_secs;
        }
        if !self.initial_interval_secs.is_finite() {
            self.initial_interval_secs = self.min_interval_secs;
        }
        self.initial_interval_secs = self
            .initial_interval_secs
            .max(self.min_interval_secs)
            .min(self.max_interval_secs);
        if !(self.target_frame_budget_ms > 0.0) || !self.target_frame_budget_ms.is_finite() {
            self.target_frame_budget_ms = Self::default().target_frame_budget_ms;
        }
        self.error_threshold = self.error_threshold.max(1);
    }
}

/// Size of the masks handed to the compositor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSettings {
    /// Defaults to the frame width
    pub mask_width: Option<u32>,
    /// Defaults to the frame height
    pub mask_height: Option<u32>,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub model: ModelSettings,
    pub stabilizer: StabilizerSettings,
    pub scheduler: SchedulerSettings,
    pub output: OutputSettings,
    pub compositor: CompositorParams,
    /// Start in fallback mode without loading a model
    pub force_demo_mode: bool,
}

impl PipelineSettings {
    /// Clamp every value into its valid range
    pub fn sanitize(&mut self) {
        let model = &mut self.model;
        model.input_width = model.input_width.max(1);
        model.input_height = model.input_height.max(1);
        model.threshold = clamp_unit(model.threshold, 0.3);

        self.stabilizer.smoothing = clamp_unit(self.stabilizer.smoothing, 0.6);

        self.scheduler.sanitize();

        self.output.mask_width = self.output.mask_width.filter(|w| *w > 0);
        self.output.mask_height = self.output.mask_height.filter(|h| *h > 0);

        self.compositor.sanitize();
    }

    /// Load and sanitize settings from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&contents)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn clamp_unit(value: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Settings-related errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.model.engine, "synthetic");
        assert_eq!(settings.model.input_name, "image");
        assert_eq!(settings.model.output_name, "predict");
        assert_eq!(settings.model.wall_class_index, 9);
        assert_eq!(settings.model.threshold, 0.3);
        assert_eq!(settings.stabilizer.buffer_size, 3);
        assert_eq!(settings.stabilizer.smoothing, 0.6);
        assert_eq!(settings.scheduler.initial_interval_secs, 0.3);
        assert_eq!(settings.scheduler.error_threshold, 3);
        assert!(!settings.force_demo_mode);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json =
            r#"{ "model": { "wallClassIndex": 2, "layout": "NHWC" }, "forceDemoMode": true }"#;
        let settings: PipelineSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.model.wall_class_index, 2);
        assert_eq!(settings.model.layout, TensorLayout::Nhwc);
        assert_eq!(settings.model.input_name, "image");
        assert_eq!(settings.stabilizer, StabilizerSettings::default());
        assert!(settings.force_demo_mode);
    }

    #[test]
    fn test_sanitize_clamps_ranges() {
        let mut settings = PipelineSettings::default();
        settings.stabilizer.smoothing = 1.7;
        settings.model.threshold = -0.2;
        settings.scheduler.min_interval_secs = 0.5;
        settings.scheduler.max_interval_secs = 0.2;
        settings.scheduler.initial_interval_secs = 3.0;
        settings.scheduler.target_frame_budget_ms = 0.0;
        settings.scheduler.error_threshold = 0;
        settings.output.mask_width = Some(0);
        settings.sanitize();

        assert_eq!(settings.stabilizer.smoothing, 1.0);
        assert_eq!(settings.model.threshold, 0.0);
        assert_eq!(settings.scheduler.max_interval_secs, 0.5);
        assert_eq!(settings.scheduler.initial_interval_secs, 0.5);
        assert_eq!(settings.scheduler.target_frame_budget_ms, 30.0);
        assert_eq!(settings.scheduler.error_threshold, 1);
        assert_eq!(settings.output.mask_width, None);
    }

    #[test]
    fn test_output_layout_from_json() {
        let json = r#"{ "model": { "outputLayout": "NHWC" } }"#;
        let settings: PipelineSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.model.output_layout, Some(TensorLayout::Nhwc));
        assert_eq!(PipelineSettings::default().model.output_layout, None);
    }

    #[test]
    fn test_scheduler_sanitize_repairs_nan_band() {
        let mut scheduler = SchedulerSettings {
            min_interval_secs: f64::NAN,
            max_interval_secs: f64::NAN,
            initial_interval_secs: f64::INFINITY,
            ..SchedulerSettings::default()
        };
        scheduler.sanitize();
        assert_eq!(scheduler.min_interval_secs, 0.1);
        assert_eq!(scheduler.max_interval_secs, 0.1);
        assert_eq!(scheduler.initial_interval_secs, 0.1);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!(
            "wall-segmentation-settings-{}.json",
            std::process::id()
        ));
        let mut settings = PipelineSettings::default();
        settings.model.activation = Activation::Softmax;
        settings.output.mask_width = Some(320);
        settings.save_to_file(&path).unwrap();

        let loaded = PipelineSettings::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = PipelineSettings::load_from_file(Path::new("/no/such/settings.json"));
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }

    #[test]
    fn test_cache_key() {
        let mut model = ModelSettings::default();
        assert_eq!(model.cache_key(), "synthetic:builtin");
        model.cache_key = Some("walls-v2".into());
        assert_eq!(model.cache_key(), "walls-v2");
    }
}
