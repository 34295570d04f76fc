//! Dense float tensors passed between pipeline stages
//!
//! A tensor is moved from stage to stage (preprocessor → worker →
//! extractor) and dropped as soon as the consuming stage is done with it.

use serde::{Deserialize, Serialize};

/// Memory layout of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TensorLayout {
    /// Batch, channel, height, width
    #[default]
    Nchw,
    /// Batch, height, width, channel
    Nhwc,
    /// Channel, height, width (no batch axis)
    Chw,
}

impl TensorLayout {
    /// Number of axes a tensor in this layout has
    pub fn rank(&self) -> usize {
        match self {
            TensorLayout::Nchw | TensorLayout::Nhwc => 4,
            TensorLayout::Chw => 3,
        }
    }

    /// Split a shape into `(channels, height, width)` for this layout
    pub fn split_dims(&self, shape: &[usize]) -> Option<(usize, usize, usize)> {
        if shape.len() != self.rank() {
            return None;
        }
        match self {
            TensorLayout::Nchw => Some((shape[1], shape[2], shape[3])),
            TensorLayout::Nhwc => Some((shape[3], shape[1], shape[2])),
            TensorLayout::Chw => Some((shape[0], shape[1], shape[2])),
        }
    }

    /// Build a single-batch shape for this layout
    pub fn shape_for(&self, channels: usize, height: usize, width: usize) -> Vec<usize> {
        match self {
            TensorLayout::Nchw => vec![1, channels, height, width],
            TensorLayout::Nhwc => vec![1, height, width, channels],
            TensorLayout::Chw => vec![channels, height, width],
        }
    }
}

/// Dense numeric buffer with an explicit shape and layout
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    layout: TensorLayout,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor; `data` is expected to hold `shape.product()` values
    pub fn new(shape: Vec<usize>, layout: TensorLayout, data: Vec<f32>) -> Self {
        Self {
            shape,
            layout,
            data,
        }
    }

    /// All-zero tensor of the given shape
    pub fn zeros(shape: Vec<usize>, layout: TensorLayout) -> Self {
        let len = shape.iter().product();
        Self::new(shape, layout, vec![0.0; len])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements the shape describes
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the buffer holds exactly as many values as the shape describes
    pub fn is_consistent(&self) -> bool {
        self.numel() == self.data.len()
    }

    /// Same values under a different layout label
    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Take the raw buffer, consuming the tensor
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_dims_per_layout() {
        assert_eq!(TensorLayout::Nchw.split_dims(&[1, 3, 4, 5]), Some((3, 4, 5)));
        assert_eq!(TensorLayout::Nhwc.split_dims(&[1, 4, 5, 3]), Some((3, 4, 5)));
        assert_eq!(TensorLayout::Chw.split_dims(&[3, 4, 5]), Some((3, 4, 5)));
        assert_eq!(TensorLayout::Chw.split_dims(&[1, 3, 4, 5]), None);
    }

    #[test]
    fn test_shape_for_roundtrips_through_split() {
        for layout in [TensorLayout::Nchw, TensorLayout::Nhwc, TensorLayout::Chw] {
            let shape = layout.shape_for(3, 16, 8);
            assert_eq!(layout.split_dims(&shape), Some((3, 16, 8)));
        }
    }

    #[test]
    fn test_layout_serde_names() {
        let json = serde_json::to_string(&TensorLayout::Nhwc).unwrap();
        assert_eq!(json, "\"NHWC\"");
        let layout: TensorLayout = serde_json::from_str("\"CHW\"").unwrap();
        assert_eq!(layout, TensorLayout::Chw);
    }

    #[test]
    fn test_consistency_check() {
        let tensor = Tensor::zeros(vec![1, 2, 2, 2], TensorLayout::Nchw);
        assert!(tensor.is_consistent());
        let short = Tensor::new(vec![1, 2, 2, 2], TensorLayout::Nchw, vec![0.0; 3]);
        assert!(!short.is_consistent());
    }
}
