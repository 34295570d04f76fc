//! Mask extraction
//!
//! Turns a raw model output tensor into a wall probability mask at the
//! requested resolution. Extraction never fails: a tensor whose shape does
//! not fit yields an all-zero mask and a warning.

use super::Mask;
use crate::error::ShapeMismatchError;
use crate::ml::{Activation, Tensor, TensorLayout};
use crate::settings::ModelSettings;

/// Axis order of the class channel within an output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelOrder {
    /// Channel-major: `[C,H,W]` / `[N,C,H,W]`
    First,
    /// Channel-minor: `[H,W,C]` / `[N,H,W,C]`
    Last,
}

/// Geometry of an output tensor, batch 0
#[derive(Debug, Clone, Copy)]
struct OutputGeometry {
    channels: usize,
    height: usize,
    width: usize,
    order: ChannelOrder,
}

impl OutputGeometry {
    fn of(tensor: &Tensor) -> Option<Self> {
        let shape = tensor.shape();
        let channel_last = tensor.layout() == TensorLayout::Nhwc;
        let (channels, height, width, order) = match (shape.len(), channel_last) {
            (2, _) => (1, shape[0], shape[1], ChannelOrder::First),
            (3, false) => (shape[0], shape[1], shape[2], ChannelOrder::First),
            (3, true) => (shape[2], shape[0], shape[1], ChannelOrder::Last),
            (4, false) => (shape[1], shape[2], shape[3], ChannelOrder::First),
            (4, true) => (shape[3], shape[1], shape[2], ChannelOrder::Last),
            _ => return None,
        };
        Some(Self {
            channels,
            height,
            width,
            order,
        })
    }

    /// Values batch 0 occupies
    fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    #[inline]
    fn index(&self, c: usize, y: usize, x: usize) -> usize {
        match self.order {
            ChannelOrder::First => (c * self.height + y) * self.width + x,
            ChannelOrder::Last => (y * self.width + x) * self.channels + c,
        }
    }
}

/// Extracts the wall-class probability from output tensors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskExtractor {
    class_index: usize,
    threshold: f32,
    activation: Activation,
}

impl MaskExtractor {
    pub fn new(class_index: usize, threshold: f32, activation: Activation) -> Self {
        Self {
            class_index,
            threshold,
            activation,
        }
    }

    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self::new(
            settings.wall_class_index,
            settings.threshold,
            settings.activation,
        )
    }

    pub fn class_index(&self) -> usize {
        self.class_index
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Build a `width` x `height` mask from `tensor`, consuming it
    ///
    /// Each target pixel samples the nearest tensor pixel at
    /// `floor(x * tensorW / targetW)`. The class index is clamped to the
    /// tensor's channel count.
    pub fn extract(&self, tensor: Tensor, width: u32, height: u32) -> Mask {
        let empty = || Mask::zeros(width, height).with_threshold(self.threshold);

        let Some(geometry) = OutputGeometry::of(&tensor) else {
            tracing::warn!(
                target: "wall_segmentation::extract",
                shape = ?tensor.shape(),
                "unsupported output rank, returning empty mask"
            );
            return empty();
        };

        let data = tensor.data();
        if geometry.len() == 0 || data.len() < geometry.len() {
            let err = ShapeMismatchError {
                shape: tensor.shape().to_vec(),
                expected: geometry.len(),
                actual: data.len(),
            };
            tracing::warn!(
                target: "wall_segmentation::extract",
                "{}, returning empty mask",
                err
            );
            return empty();
        }

        let class = self.class_index.min(geometry.channels - 1);
        if class != self.class_index {
            tracing::trace!(
                target: "wall_segmentation::extract",
                requested = self.class_index,
                channels = geometry.channels,
                "class index clamped"
            );
        }

        let (tw, th) = (geometry.width, geometry.height);
        let (dw, dh) = (width as usize, height as usize);
        let mut values = Vec::with_capacity(dw * dh);
        for y in 0..dh {
            let sy = y * th / dh;
            for x in 0..dw {
                let sx = x * tw / dw;
                values.push(self.probability(data, &geometry, class, sy, sx));
            }
        }

        Mask::new(width, height, values)
            .map(|mask| mask.with_threshold(self.threshold))
            .unwrap_or_else(|_| empty())
    }

    fn probability(
        &self,
        data: &[f32],
        geometry: &OutputGeometry,
        class: usize,
        y: usize,
        x: usize,
    ) -> f32 {
        let raw = data[geometry.index(class, y, x)];
        let p = match self.activation {
            Activation::Identity => raw,
            Activation::Sigmoid => 1.0 / (1.0 + (-raw).exp()),
            Activation::Softmax => {
                let logits = (0..geometry.channels).map(|c| data[geometry.index(c, y, x)]);
                let max = logits.clone().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = logits.map(|v| (v - max).exp()).sum();
                (raw - max).exp() / sum
            }
        };
        if p.is_nan() {
            0.0
        } else {
            p.clamp(0.0, 1.0)
        }
    }
}

/// Extract with identity activation
pub fn extract(
    tensor: Tensor,
    class_index: usize,
    threshold: f32,
    width: u32,
    height: u32,
) -> Mask {
    MaskExtractor::new(class_index, threshold, Activation::Identity).extract(tensor, width, height)
}
