//! Frame preprocessing
//!
//! Resizes a camera frame to the model's input resolution with
//! align-corners bilinear interpolation, converts it to the model's channel
//! count and layout, and applies optional per-channel normalization.

use ndarray::Array3;

use crate::camera::CameraFrame;
use crate::error::ShapeMismatchError;
use crate::ml::{ModelSpec, Tensor, TensorLayout};

/// Convert `frame` into a freshly allocated input tensor for `spec`
///
/// The frame is never modified. Identical inputs give bit-identical tensors.
pub fn preprocess(frame: &CameraFrame, spec: &ModelSpec) -> Result<Tensor, ShapeMismatchError> {
    if !frame.is_valid() {
        return Err(ShapeMismatchError {
            shape: vec![frame.height as usize, frame.width as usize, 4],
            expected: frame.width as usize * frame.height as usize * 4,
            actual: frame.data.len(),
        });
    }
    let (channels, height, width) = spec.input_dims();

    let mut hwc = resample_bilinear(frame, width, height, channels);
    if let Some(norm) = &spec.normalization {
        for c in 0..channels {
            let (mean, std) = norm.channel(c);
            hwc.index_axis_mut(ndarray::Axis(2), c)
                .mapv_inplace(|v| (v - mean) / std);
        }
    }

    let shape = spec.layout.shape_for(channels, height, width);
    let data = match spec.layout {
        TensorLayout::Nhwc => hwc.into_raw_vec_and_offset().0,
        TensorLayout::Nchw | TensorLayout::Chw => {
            hwc.permuted_axes([2, 0, 1]).iter().copied().collect()
        }
    };
    Ok(Tensor::new(shape, spec.layout, data))
}

/// Source coordinate and blend factor for output index `i`
#[inline]
fn sample_coord(i: usize, ratio: f32, src_len: usize) -> (usize, usize, f32) {
    let pos = i as f32 * ratio;
    let i0 = (pos.floor() as usize).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    (i0, i1, pos - i0 as f32)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Bilinear resize into an HWC array of `channels` values in [0, 1]
///
/// 1 channel takes the mean of RGB, 3 keeps RGB, 4 keeps RGBA.
fn resample_bilinear(
    frame: &CameraFrame,
    width: usize,
    height: usize,
    channels: usize,
) -> Array3<f32> {
    let (sw, sh) = (frame.width as usize, frame.height as usize);
    let ratio = |src: usize, dst: usize| {
        if dst > 1 {
            (src - 1) as f32 / (dst - 1) as f32
        } else {
            0.0
        }
    };
    let x_ratio = ratio(sw, width);
    let y_ratio = ratio(sh, height);

    let texel = |x: usize, y: usize| -> [f32; 4] {
        let i = (y * sw + x) * 4;
        let d = &frame.data[i..i + 4];
        [
            d[0] as f32 / 255.0,
            d[1] as f32 / 255.0,
            d[2] as f32 / 255.0,
            d[3] as f32 / 255.0,
        ]
    };

    let mut out = Array3::<f32>::zeros((height, width, channels));
    for y in 0..height {
        let (y0, y1, fy) = sample_coord(y, y_ratio, sh);
        for x in 0..width {
            let (x0, x1, fx) = sample_coord(x, x_ratio, sw);
            let (p00, p10, p01, p11) = (texel(x0, y0), texel(x1, y0), texel(x0, y1), texel(x1, y1));

            let mut rgba = [0.0f32; 4];
            for (c, value) in rgba.iter_mut().enumerate() {
                let top = lerp(p00[c], p10[c], fx);
                let bottom = lerp(p01[c], p11[c], fx);
                *value = lerp(top, bottom, fy);
            }

            match channels {
                1 => out[[y, x, 0]] = (rgba[0] + rgba[1] + rgba[2]) / 3.0,
                _ => {
                    for c in 0..channels.min(4) {
                        out[[y, x, c]] = rgba[c];
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{Activation, Normalization};

    fn spec(layout: TensorLayout, channels: usize, h: usize, w: usize) -> ModelSpec {
        ModelSpec {
            input_name: "image".into(),
            input_shape: layout.shape_for(channels, h, w),
            output_name: "predict".into(),
            output_shape: vec![1, 1, h, w],
            layout,
            output_layout: None,
            normalization: None,
            activation: Activation::Identity,
        }
    }

    fn gradient_frame(w: u32, h: u32) -> CameraFrame {
        let mut data = Vec::new();
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[(x * 40) as u8, (y * 40) as u8, 100, 255]);
            }
        }
        CameraFrame::new(data, w, h, 0)
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let frame = gradient_frame(6, 5);
        let spec = spec(TensorLayout::Nchw, 3, 4, 4);
        let a = preprocess(&frame, &spec).unwrap();
        let b = preprocess(&frame, &spec).unwrap();
        assert_eq!(a.shape(), &[1, 3, 4, 4]);
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_does_not_mutate_frame() {
        let frame = gradient_frame(3, 3);
        let before = frame.data.clone();
        let _ = preprocess(&frame, &spec(TensorLayout::Nhwc, 3, 2, 2)).unwrap();
        assert_eq!(frame.data, before);
    }

    #[test]
    fn test_align_corners_keeps_corner_pixels() {
        let frame = gradient_frame(5, 5);
        let tensor = preprocess(&frame, &spec(TensorLayout::Nhwc, 3, 3, 3)).unwrap();
        let data = tensor.data();
        // Top-left (0,0) and bottom-right (4,4) map exactly onto source pixels
        assert_eq!(data[0], 0.0);
        let last = (2 * 3 + 2) * 3;
        assert_eq!(data[last], 160.0 / 255.0);
        assert_eq!(data[last + 1], 160.0 / 255.0);
    }

    #[test]
    fn test_bilinear_midpoint_blend() {
        // 2x1 frame: red 0 then red 200; 3 outputs sample 0, 0.5, 1
        let frame = CameraFrame::new(vec![0, 0, 0, 255, 200, 0, 0, 255], 2, 1, 0);
        let tensor = preprocess(&frame, &spec(TensorLayout::Nhwc, 3, 1, 3)).unwrap();
        let red: Vec<f32> = tensor.data().chunks(3).map(|p| p[0]).collect();
        assert_eq!(red[0], 0.0);
        assert!((red[1] - 100.0 / 255.0).abs() < 1e-6);
        assert_eq!(red[2], 200.0 / 255.0);
    }

    #[test]
    fn test_layouts_hold_same_values() {
        let frame = gradient_frame(4, 4);
        let nchw = preprocess(&frame, &spec(TensorLayout::Nchw, 3, 2, 2)).unwrap();
        let nhwc = preprocess(&frame, &spec(TensorLayout::Nhwc, 3, 2, 2)).unwrap();
        let chw = preprocess(&frame, &spec(TensorLayout::Chw, 3, 2, 2)).unwrap();
        assert_eq!(nchw.data(), chw.data());
        // NCHW channel 1 at pixel (1,0) equals NHWC pixel (1,0) channel 1
        assert_eq!(nchw.data()[4 + 1], nhwc.data()[3 + 1]);
        assert_eq!(chw.shape(), &[3, 2, 2]);
    }

    #[test]
    fn test_single_channel_is_luminance() {
        let frame = CameraFrame::solid(2, 2, [30, 60, 90, 255]);
        let tensor = preprocess(&frame, &spec(TensorLayout::Nchw, 1, 1, 1)).unwrap();
        let expected: f32 = (30.0 / 255.0 + 60.0 / 255.0 + 90.0 / 255.0) / 3.0;
        assert!((tensor.data()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_normalization_applied_per_channel() {
        let frame = CameraFrame::solid(2, 2, [255, 0, 255, 255]);
        let mut spec = spec(TensorLayout::Nchw, 3, 1, 1);
        spec.normalization = Some(Normalization {
            mean: vec![0.5, 0.5, 0.0],
            std: vec![0.5, 0.5, 2.0],
        });
        let tensor = preprocess(&frame, &spec).unwrap();
        assert_eq!(tensor.data(), &[1.0, -1.0, 0.5]);
    }

    #[test]
    fn test_invalid_frame_is_rejected() {
        let frame = CameraFrame::new(vec![0; 5], 2, 2, 0);
        assert!(preprocess(&frame, &spec(TensorLayout::Nchw, 3, 2, 2)).is_err());
    }
}
