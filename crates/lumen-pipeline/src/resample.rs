//! Importing the base image into a requested region and scale.
//!
//! Unscaled requests are a plain crop copy. Scaled requests crop the
//! covering source rectangle and resize it with the configured filter.
//! Pixels of the region that fall outside the image are left black.

use std::fmt;

use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};

use crate::roi::{CHANNELS, Roi};
use crate::types::BaseImage;

/// Resampling filter used when the requested scale is not 1.
///
/// Ordered from fastest/lowest-quality to slowest/highest-quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResampleFilter {
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Gaussian: moderate speed, smooth output.
    Gaussian,
    /// Lanczos with 3 lobes: slowest, sharpest.
    Lanczos3,
}

impl ResampleFilter {
    /// Convert to the `image` crate's `FilterType`.
    const fn to_image_filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Gaussian => FilterType::Gaussian,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for ResampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Gaussian => f.write_str("Gaussian"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Fill `out` with the base image's pixels for `roi`.
///
/// `out` must hold at least `roi.buffer_len()` floats.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
pub fn clip_and_zoom(base: &BaseImage, roi: &Roi, filter: ResampleFilter, out: &mut [f32]) {
    let len = roi.buffer_len().min(out.len());
    out[..len].fill(0.0);
    if roi.is_empty() || roi.scale <= 0.0 || !roi.scale.is_finite() {
        return;
    }

    let dims = base.dimensions();
    if (roi.scale - 1.0).abs() < f32::EPSILON {
        let src_extent = crate::types::Dimensions::new(dims.width, dims.height);
        let covered = roi.clamp_to(src_extent);
        copy_rect(
            base.as_slice(),
            dims.width,
            (covered.x as u32, covered.y as u32),
            covered.dimensions(),
            out,
            roi.width,
            ((covered.x - roi.x) as u32, (covered.y - roi.y) as u32),
        );
        return;
    }

    let s = roi.scale;
    let sx0 = (roi.x as f32 / s).floor().clamp(0.0, dims.width as f32) as u32;
    let sy0 = (roi.y as f32 / s).floor().clamp(0.0, dims.height as f32) as u32;
    let sx1 = ((roi.x as f32 + roi.width as f32) / s).ceil().clamp(0.0, dims.width as f32) as u32;
    let sy1 = ((roi.y as f32 + roi.height as f32) / s).ceil().clamp(0.0, dims.height as f32) as u32;
    if sx1 <= sx0 || sy1 <= sy0 {
        return;
    }
    let (sw, sh) = (sx1 - sx0, sy1 - sy0);
    let source = imageops::crop_imm(base.image(), sx0, sy0, sw, sh).to_image();
    let dw = ((sw as f32) * s).round().max(1.0) as u32;
    let dh = ((sh as f32) * s).round().max(1.0) as u32;
    let resized = imageops::resize(&source, dw, dh, filter.to_image_filter());

    // Where the resized block lands in the region's frame.
    let dx = ((sx0 as f32) * s).round() as i64 - i64::from(roi.x);
    let dy = ((sy0 as f32) * s).round() as i64 - i64::from(roi.y);
    let skip_x = (-dx).max(0) as u32;
    let skip_y = (-dy).max(0) as u32;
    let dst_x = dx.max(0) as u32;
    let dst_y = dy.max(0) as u32;
    if dst_x >= roi.width || dst_y >= roi.height || skip_x >= dw || skip_y >= dh {
        return;
    }
    let copy = crate::types::Dimensions::new(
        (dw - skip_x).min(roi.width - dst_x),
        (dh - skip_y).min(roi.height - dst_y),
    );
    copy_rect(
        resized.as_raw(),
        dw,
        (skip_x, skip_y),
        copy,
        out,
        roi.width,
        (dst_x, dst_y),
    );
}

/// Copy a `size` rectangle from `src` at `from` to `dst` at `to`.
fn copy_rect(
    src: &[f32],
    src_width: u32,
    from: (u32, u32),
    size: crate::types::Dimensions,
    dst: &mut [f32],
    dst_width: u32,
    to: (u32, u32),
) {
    let row_len = size.width as usize * CHANNELS;
    for row in 0..size.height as usize {
        let s = ((from.1 as usize + row) * src_width as usize + from.0 as usize) * CHANNELS;
        let d = ((to.1 as usize + row) * dst_width as usize + to.0 as usize) * CHANNELS;
        if s + row_len > src.len() || d + row_len > dst.len() {
            return;
        }
        dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
    }
}
