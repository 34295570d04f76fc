//! Paint compositor boundary
//!
//! The compositor itself lives in the host renderer. This module defines
//! what crosses the boundary: the hard display mask, the paint parameters
//! passed straight through, and their GPU uniform packing.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::segmentation::Mask;

/// Paint blend parameters, passed through untouched apart from clamping
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositorParams {
    /// Paint color, RGBA in [0, 1]
    pub color: [f32; 4],
    pub opacity: f32,
    /// How much of the original luminance survives under the paint
    pub preserve_shadows: f32,
    pub edge_smoothing: f32,
    /// Show the raw mask instead of paint
    pub debug_view: bool,
}

impl Default for CompositorParams {
    fn default() -> Self {
        Self {
            color: [1.0, 0.0, 0.0, 1.0],
            opacity: 0.7,
            preserve_shadows: 0.8,
            edge_smoothing: 0.0,
            debug_view: false,
        }
    }
}

fn unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl CompositorParams {
    /// Clamp every value into [0, 1]
    pub fn sanitize(&mut self) {
        for c in self.color.iter_mut() {
            *c = unit(*c);
        }
        self.opacity = unit(self.opacity);
        self.preserve_shadows = unit(self.preserve_shadows);
        self.edge_smoothing = unit(self.edge_smoothing);
    }

    /// Pack for a uniform buffer, with the mask's display threshold
    pub fn to_uniforms(&self, threshold: f32) -> CompositorUniforms {
        CompositorUniforms {
            paint_color: self.color,
            opacity: self.opacity,
            preserve_shadows: self.preserve_shadows,
            edge_smoothing: self.edge_smoothing,
            debug_view: if self.debug_view { 1.0 } else { 0.0 },
            threshold,
            _pad: [0.0; 3],
        }
    }
}

/// Compositor parameters as laid out in the shader's uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CompositorUniforms {
    pub paint_color: [f32; 4],
    pub opacity: f32,
    pub preserve_shadows: f32,
    pub edge_smoothing: f32,
    pub debug_view: f32,
    pub threshold: f32,
    pub _pad: [f32; 3],
}

/// Hard wall/no-wall mask: 255 for wall, 0 otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    pub width: u32,
    pub height: u32,
    pub values: Vec<u8>,
}

impl BinaryMask {
    #[inline]
    pub fn is_wall(&self, x: u32, y: u32) -> bool {
        self.values[(y * self.width + x) as usize] != 0
    }

    /// Fraction of wall pixels
    pub fn coverage(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let wall = self.values.iter().filter(|v| **v != 0).count();
        wall as f32 / self.values.len() as f32
    }

    pub fn to_gray_image(&self) -> image::GrayImage {
        image::GrayImage::from_raw(self.width, self.height, self.values.clone())
            .unwrap_or_else(|| image::GrayImage::new(self.width, self.height))
    }
}

/// Threshold a stabilized mask for display: `value > t` is wall
pub fn threshold_for_display(mask: &Mask, threshold: f32) -> BinaryMask {
    BinaryMask {
        width: mask.width(),
        height: mask.height(),
        values: mask
            .values()
            .iter()
            .map(|v| if *v > threshold { 255 } else { 0 })
            .collect(),
    }
}

/// Everything the host compositor needs for one frame
#[derive(Debug, Clone)]
pub struct CompositeFrame {
    /// Stabilized probabilities
    pub mask: Mask,
    /// `mask` thresholded at its display threshold
    pub binary: BinaryMask,
    pub params: CompositorParams,
    /// Set while the static fallback mask is shown
    pub fallback: Option<String>,
}

impl CompositeFrame {
    pub fn new(mask: Mask, params: CompositorParams, fallback: Option<String>) -> Self {
        let binary = threshold_for_display(&mask, mask.threshold());
        Self {
            mask,
            binary,
            params,
            fallback,
        }
    }

    pub fn uniforms(&self) -> CompositorUniforms {
        self.params.to_uniforms(self.mask.threshold())
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}
