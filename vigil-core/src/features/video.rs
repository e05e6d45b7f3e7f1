//! Video descriptors computed on the luma plane of a single frame.

use serde::{Deserialize, Serialize};

use crate::buffering::chunk::StreamKind;
use crate::error::FeatureError;

/// Raw frame layout of video payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// One byte of luma per pixel.
    #[default]
    Gray8,
    /// Packed 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
        }
    }
}

pub const HISTOGRAM_BINS: usize = 10;

/// Order of `FeatureVector::video_features`.
pub const VIDEO_FEATURES: [&str; 18] = [
    "luma_mean",
    "luma_std",
    "luma_min",
    "luma_max",
    "hist_0",
    "hist_1",
    "hist_2",
    "hist_3",
    "hist_4",
    "hist_5",
    "hist_6",
    "hist_7",
    "hist_8",
    "hist_9",
    "diff_left_right",
    "diff_top_bottom",
    "gradient_x",
    "gradient_y",
];

/// Validate a frame and convert it to luma in [0, 1].
pub fn luma(
    payload: &[u8],
    expected_bytes: usize,
    format: PixelFormat,
) -> Result<Vec<f32>, FeatureError> {
    if payload.is_empty() {
        return Err(FeatureError::EmptyPayload(StreamKind::Video));
    }
    if payload.len() != expected_bytes {
        return Err(FeatureError::VideoLengthMismatch {
            expected: expected_bytes,
            actual: payload.len(),
        });
    }
    Ok(match format {
        PixelFormat::Gray8 => payload.iter().map(|p| *p as f32 / 255.0).collect(),
        PixelFormat::Rgb24 => payload
            .chunks_exact(3)
            .map(|px| {
                // ITU-R BT.601 weights
                (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) as f32
                    / (1000.0 * 255.0)
            })
            .collect(),
    })
}

/// Compute `VIDEO_FEATURES` for a `width`×`height` luma plane.
pub fn describe(luma: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(VIDEO_FEATURES.len());
    let n = luma.len().max(1) as f32;

    let mean = luma.iter().sum::<f32>() / n;
    let std = (luma.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
    let min = luma.iter().copied().fold(f32::INFINITY, f32::min);
    let max = luma.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    out.extend([mean, std, min.min(1.0).max(0.0), max.max(0.0).min(1.0)]);

    let mut hist = [0.0f32; HISTOGRAM_BINS];
    for v in luma {
        let bin = ((v * HISTOGRAM_BINS as f32) as usize).min(HISTOGRAM_BINS - 1);
        hist[bin] += 1.0;
    }
    out.extend(hist.iter().map(|c| c / n));

    let half_w = width / 2;
    let half_h = height / 2;
    let region_mean = |xs: std::ops::Range<usize>, ys: std::ops::Range<usize>| {
        let mut sum = 0.0;
        let mut count = 0usize;
        for y in ys {
            for x in xs.clone() {
                sum += luma[y * width + x];
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    };
    let left_right = (region_mean(0..half_w, 0..height) - region_mean(half_w..width, 0..height)).abs();
    let top_bottom = (region_mean(0..width, 0..half_h) - region_mean(0..width, half_h..height)).abs();
    out.extend([left_right, top_bottom]);

    let mut gx = 0.0;
    let mut gx_n = 0usize;
    let mut gy = 0.0;
    let mut gy_n = 0usize;
    for y in 0..height {
        for x in 0..width {
            let v = luma[y * width + x];
            if x + 1 < width {
                gx += (luma[y * width + x + 1] - v).abs();
                gx_n += 1;
            }
            if y + 1 < height {
                gy += (luma[(y + 1) * width + x] - v).abs();
                gy_n += 1;
            }
        }
    }
    out.push(if gx_n == 0 { 0.0 } else { gx / gx_n as f32 });
    out.push(if gy_n == 0 { 0.0 } else { gy / gy_n as f32 });

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn flat_frame_has_no_variation() {
        let l = luma(&[60; 12], 12, PixelFormat::Gray8).unwrap();
        let f = describe(&l, 4, 3);
        assert_abs_diff_eq!(f[0], 60.0 / 255.0, epsilon = 1e-6);
        assert_eq!(f[1], 0.0);
        assert_eq!(f[4 + 2], 1.0);
        assert_eq!(&f[14..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn split_frame_shows_region_difference() {
        // Left half black, right half white, 4x2.
        let l = luma(&[0, 0, 255, 255, 0, 0, 255, 255], 8, PixelFormat::Gray8).unwrap();
        let f = describe(&l, 4, 2);
        assert_abs_diff_eq!(f[14], 1.0, epsilon = 1e-6);
        assert_eq!(f[15], 0.0);
        assert_abs_diff_eq!(f[16], 1.0 / 3.0, epsilon = 1e-6);
        assert_eq!(f[17], 0.0);
        assert_abs_diff_eq!(f[4] + f[13], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn rgb_is_converted_to_luma() {
        let l = luma(&[255, 255, 255, 255, 0, 0], 6, PixelFormat::Rgb24).unwrap();
        assert_abs_diff_eq!(l[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(l[1], 0.299, epsilon = 1e-6);
    }

    #[test]
    fn length_is_checked_against_format() {
        assert_eq!(
            luma(&[0; 5], 6, PixelFormat::Rgb24),
            Err(FeatureError::VideoLengthMismatch {
                expected: 6,
                actual: 5
            })
        );
    }
}
