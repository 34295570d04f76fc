//! Segmentation stages
//!
//! Frame → [`preprocess`] → (worker) → [`MaskExtractor`] → [`MaskHistory`]

mod extract;
mod mask;
mod preprocess;
mod stabilizer;

pub use extract::{extract, MaskExtractor};
pub use mask::{Mask, DEFAULT_DISPLAY_THRESHOLD};
pub use preprocess::preprocess;
pub use stabilizer::{blend_weights, MaskHistory};
