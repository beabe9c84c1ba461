//! Splitting a stage invocation into overlapping tiles so it fits a
//! memory budget.
//!
//! Only stages whose input and output cover the same area are tiled.
//! Each tile is processed with `overlap` extra context pixels on every
//! side (clamped at the buffer edge); only the tile core is written
//! back, so stages with a bounded footprint produce the same result as
//! an untiled run.

use tracing::debug;

use crate::roi::{BYTES_PER_PIXEL, CHANNELS, Roi};
use crate::stage::TilingRequirements;

/// A rectangle in buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// One tile: the pixels it produces and the pixels it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Region written back to the output.
    pub core: Rect,
    /// Region handed to the stage (core plus overlap, clamped).
    pub padded: Rect,
}

/// Largest tile, in pixels, that fits `budget` bytes.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn max_tile_pixels(req: &TilingRequirements, budget: usize) -> usize {
    let per_pixel = BYTES_PER_PIXEL as f64 * f64::from(req.factor.max(1.0));
    (budget.saturating_sub(req.overhead) as f64 / per_pixel).floor() as usize
}

/// Cover a `width` x `height` buffer with tiles of at most
/// `max_pixels` padded pixels each.
///
/// Returns `None` if even a one-pixel core with its overlap does not
/// fit.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn plan_tiles(width: u32, height: u32, overlap: u32, max_pixels: usize) -> Option<Vec<Tile>> {
    if width == 0 || height == 0 {
        return Some(Vec::new());
    }
    let side = (max_pixels as f64).sqrt().floor() as u32;
    let core = side.checked_sub(2 * overlap).filter(|&c| c > 0)?;
    let core_w = core.min(width);
    let core_h = core.min(height);

    let mut tiles = Vec::new();
    let mut y = 0;
    while y < height {
        let h = core_h.min(height - y);
        let mut x = 0;
        while x < width {
            let w = core_w.min(width - x);
            let px = x.saturating_sub(overlap);
            let py = y.saturating_sub(overlap);
            let px1 = (x + w + overlap).min(width);
            let py1 = (y + h + overlap).min(height);
            tiles.push(Tile {
                core: Rect {
                    x,
                    y,
                    width: w,
                    height: h,
                },
                padded: Rect {
                    x: px,
                    y: py,
                    width: px1 - px,
                    height: py1 - py,
                },
            });
            x += w;
        }
        y += h;
    }
    Some(tiles)
}

/// Run `process` tile by tile over `input`, writing `output`.
///
/// `process` receives the padded tile input, a padded-size output
/// buffer, and the tile's region in the pipeline frame.
///
/// # Errors
///
/// Stops at and returns the first error from `process`.
pub fn run_tiled<E>(
    input: &[f32],
    output: &mut [f32],
    roi: &Roi,
    tiles: &[Tile],
    mut process: impl FnMut(&[f32], &mut [f32], &Roi) -> Result<(), E>,
) -> Result<(), E> {
    debug!(tiles = tiles.len(), width = roi.width, height = roi.height, "tiled run");
    let stride = roi.width as usize;
    for tile in tiles {
        let p = tile.padded;
        let mut tile_in = vec![0.0; p.width as usize * p.height as usize * CHANNELS];
        copy_block(input, stride, p, &mut tile_in, p.width as usize, (0, 0));
        let mut tile_out = vec![0.0; tile_in.len()];
        #[allow(clippy::cast_possible_wrap)]
        let tile_roi = Roi::new(
            roi.x + p.x as i32,
            roi.y + p.y as i32,
            p.width,
            p.height,
            roi.scale,
        );
        process(&tile_in, &mut tile_out, &tile_roi)?;

        // Write back only the core.
        let c = tile.core;
        let core_in_tile = Rect {
            x: c.x - p.x,
            y: c.y - p.y,
            width: c.width,
            height: c.height,
        };
        copy_block(
            &tile_out,
            p.width as usize,
            core_in_tile,
            output,
            stride,
            (c.x as usize, c.y as usize),
        );
    }
    Ok(())
}

/// Copy `rect` of `src` (row stride `src_stride` pixels) into `dst` at
/// `to`.
fn copy_block(
    src: &[f32],
    src_stride: usize,
    rect: Rect,
    dst: &mut [f32],
    dst_stride: usize,
    to: (usize, usize),
) {
    let row_len = rect.width as usize * CHANNELS;
    for row in 0..rect.height as usize {
        let s = ((rect.y as usize + row) * src_stride + rect.x as usize) * CHANNELS;
        let d = ((to.1 + row) * dst_stride + to.0) * CHANNELS;
        if s + row_len > src.len() || d + row_len > dst.len() {
            return;
        }
        dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
    }
}
