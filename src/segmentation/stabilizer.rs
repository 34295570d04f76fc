//! Temporal stabilization
//!
//! Blends each new mask with the last few masks using exponentially
//! decaying weights, so single-frame misclassifications fade out instead of
//! flickering.

use std::collections::VecDeque;

use super::Mask;
use crate::settings::StabilizerSettings;

/// Normalized blend weights for a history of `n` masks, oldest first
///
/// Entry `i` gets `(1 - s)^(n - 1 - i)` before normalization. A smoothing
/// factor of 0 puts all weight on the newest mask.
pub fn blend_weights(n: usize, smoothing: f32) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    if smoothing <= 0.0 {
        let mut weights = vec![0.0; n];
        weights[n - 1] = 1.0;
        return weights;
    }

    let decay = 1.0 - smoothing.min(1.0);
    let raw: Vec<f32> = (0..n).map(|i| decay.powi((n - 1 - i) as i32)).collect();
    let total: f32 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Ring buffer of the last K masks plus the precomputed weight table
#[derive(Debug, Clone)]
pub struct MaskHistory {
    capacity: usize,
    smoothing: f32,
    entries: VecDeque<Mask>,
    /// `weights[n - 1]` holds the weights for a history of length `n`
    weights: Vec<Vec<f32>>,
}

impl MaskHistory {
    /// History holding up to `capacity` masks; 0 disables smoothing
    pub fn new(capacity: usize, smoothing: f32) -> Self {
        let smoothing = if smoothing.is_nan() {
            0.0
        } else {
            smoothing.clamp(0.0, 1.0)
        };
        let weights = (1..=capacity).map(|n| blend_weights(n, smoothing)).collect();
        Self {
            capacity,
            smoothing,
            entries: VecDeque::with_capacity(capacity),
            weights,
        }
    }

    pub fn from_settings(settings: &StabilizerSettings) -> Self {
        Self::new(settings.buffer_size, settings.smoothing)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recently pushed (unblended) mask
    pub fn latest(&self) -> Option<&Mask> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record `mask` and return its blend with the history
    ///
    /// The oldest entry is evicted once K masks are stored. When `mask` has
    /// new dimensions, older entries are resampled to match.
    pub fn push(&mut self, mask: Mask) -> Mask {
        if self.capacity == 0 {
            return mask;
        }

        let dims = mask.dimensions();
        if self.entries.front().is_some_and(|m| m.dimensions() != dims) {
            tracing::debug!(
                target: "wall_segmentation::stabilizer",
                width = dims.0,
                height = dims.1,
                "mask size changed, resampling history"
            );
            for entry in self.entries.iter_mut() {
                *entry = entry.resized_nearest(dims.0, dims.1);
            }
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let threshold = mask.threshold();
        self.entries.push_back(mask);

        self.blend().with_threshold(threshold)
    }

    fn blend(&self) -> Mask {
        let n = self.entries.len();
        let weights = &self.weights[n - 1];
        let (width, height) = self.entries[n - 1].dimensions();
        let pixels = width as usize * height as usize;

        let mut values = vec![0.0f32; pixels];
        for (p, out) in values.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for (entry, w) in self.entries.iter().zip(weights) {
                let v = entry.values()[p];
                acc += w * v;
                lo = lo.min(v);
                hi = hi.max(v);
            }
            // Rounding must not push the blend outside its inputs.
            *out = acc.clamp(lo, hi);
        }

        let mut mask = Mask::zeros(width, height);
        mask.values_mut().copy_from_slice(&values);
        mask
    }
}
