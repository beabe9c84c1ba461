//! Regions of interest: the rectangles stages negotiate while walking
//! the pipeline backwards from the requested output.

use serde::{Deserialize, Serialize};

use crate::types::Dimensions;

/// Floats per pixel in every buffer the pipeline moves around (RGBA).
pub const CHANNELS: usize = 4;

/// Bytes per pixel (`CHANNELS` 32-bit floats).
pub const BYTES_PER_PIXEL: usize = CHANNELS * std::mem::size_of::<f32>();

/// A rectangular region of an image at a given scale.
///
/// Coordinates are in the scaled frame: `x = 100` at `scale = 0.5`
/// starts 200 pixels into the unscaled image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge (scaled pixels). May be negative while stages negotiate.
    pub x: i32,
    /// Top edge (scaled pixels).
    pub y: i32,
    /// Width in scaled pixels.
    pub width: u32,
    /// Height in scaled pixels.
    pub height: u32,
    /// Scale factor relative to the pipeline input.
    pub scale: f32,
}

impl Roi {
    /// Create a region.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32, scale: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale,
        }
    }

    /// The whole of an image of the given dimensions at scale 1.
    #[must_use]
    pub const fn full(dimensions: Dimensions) -> Self {
        Self::new(0, 0, dimensions.width, dimensions.height, 1.0)
    }

    /// Number of pixels covered.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of `f32` values a buffer for this region holds.
    #[must_use]
    pub const fn buffer_len(&self) -> usize {
        self.pixel_count() * CHANNELS
    }

    /// Size in bytes of a buffer for this region.
    #[must_use]
    pub const fn buffer_bytes(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }

    /// Returns `true` if the region covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width and height as [`Dimensions`].
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// Returns `true` if both regions cover the same pixels at the same
    /// scale, which is what blending and tiling need.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn same_area(&self, other: &Self) -> bool {
        self.x == other.x
            && self.y == other.y
            && self.width == other.width
            && self.height == other.height
            && self.scale == other.scale
    }

    /// Returns `true` if this region is the whole of `extent` at scale 1.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_full_frame_of(&self, extent: Dimensions) -> bool {
        self.scale == 1.0
            && self.x == 0
            && self.y == 0
            && self.width == extent.width
            && self.height == extent.height
    }

    /// Clamp the region so it lies inside `extent` (in the same scaled
    /// frame). Regions entirely outside collapse to an empty region at
    /// the nearest corner.
    #[must_use]
    pub fn clamp_to(&self, extent: Dimensions) -> Self {
        let ew = i64::from(extent.width);
        let eh = i64::from(extent.height);
        let x0 = i64::from(self.x).clamp(0, ew);
        let y0 = i64::from(self.y).clamp(0, eh);
        let x1 = (i64::from(self.x) + i64::from(self.width)).clamp(x0, ew);
        let y1 = (i64::from(self.y) + i64::from(self.height)).clamp(y0, eh);
        // All four values are within [0, u32::MAX] after clamping.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
            scale: self.scale,
        }
    }

    /// Byte image of the region, folded into cache hashes.
    #[must_use]
    pub fn hash_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.width.to_le_bytes());
        out[12..16].copy_from_slice(&self.height.to_le_bytes());
        out[16..20].copy_from_slice(&self.scale.to_le_bytes());
        out
    }
}
