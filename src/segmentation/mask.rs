//! Per-pixel wall probability masks

use crate::error::ShapeMismatchError;

/// Display threshold used when none is configured
pub const DEFAULT_DISPLAY_THRESHOLD: f32 = 0.5;

/// Row-major 2D buffer of wall probabilities in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    values: Vec<f32>,
    /// Threshold the compositor should apply; values themselves stay continuous
    threshold: f32,
}

impl Mask {
    /// Wrap `values`, which must hold exactly `width * height` entries
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self, ShapeMismatchError> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(ShapeMismatchError {
                shape: vec![height as usize, width as usize],
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            width,
            height,
            values,
            threshold: DEFAULT_DISPLAY_THRESHOLD,
        })
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            values: vec![value; width as usize * height as usize],
            threshold: DEFAULT_DISPLAY_THRESHOLD,
        }
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self::filled(width, height, 0.0)
    }

    /// Static placeholder: a wall in the central region of the frame
    ///
    /// Pixels strictly inside x in (0.3w, 0.7w) and y in (0.2h, 0.8h) are 1.
    pub fn demo(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let mut values = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            let yf = y as f32;
            let row_in = yf > h * 0.2 && yf < h * 0.8;
            for x in 0..width {
                let xf = x as f32;
                let is_wall = row_in && xf > w * 0.3 && xf < w * 0.7;
                values.push(if is_wall { 1.0 } else { 0.0 });
            }
        }
        Self {
            width,
            height,
            values,
            threshold: DEFAULT_DISPLAY_THRESHOLD,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[(y * self.width + x) as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fraction of pixels above `threshold`
    pub fn coverage(&self, threshold: f32) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let above = self.values.iter().filter(|v| **v > threshold).count();
        above as f32 / self.values.len() as f32
    }

    /// Nearest-neighbour resample using `floor(x * srcW / dstW)`
    pub fn resized_nearest(&self, width: u32, height: u32) -> Mask {
        if (width, height) == (self.width, self.height) {
            return self.clone();
        }
        if self.is_empty() {
            return Mask::zeros(width, height).with_threshold(self.threshold);
        }

        let (sw, sh) = (self.width as usize, self.height as usize);
        let (dw, dh) = (width as usize, height as usize);
        let mut values = Vec::with_capacity(dw * dh);
        for y in 0..dh {
            let sy = (y * sh / dh).min(sh - 1);
            for x in 0..dw {
                let sx = (x * sw / dw).min(sw - 1);
                values.push(self.values[sy * sw + sx]);
            }
        }
        Mask {
            width,
            height,
            values,
            threshold: self.threshold,
        }
    }

    /// 8-bit grayscale rendering for debug views
    pub fn to_gray_image(&self) -> image::GrayImage {
        let pixels = self
            .values
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        image::GrayImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| image::GrayImage::new(self.width, self.height))
    }
}
