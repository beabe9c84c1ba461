//! Per-request inputs that are not part of the stage list: which stage
//! has focus, active color pickers, and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::roi::Roi;

/// A region sampled by a color picker, in normalized `0.0..=1.0`
/// coordinates of the buffer it is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleRegion {
    /// A single point `[x, y]`.
    Point([f32; 2]),
    /// A box `[x0, y0, x1, y1]`.
    Box([f32; 4]),
}

impl SampleRegion {
    /// Byte image of the region, folded into cache hashes.
    #[must_use]
    pub fn hash_bytes(&self) -> Vec<u8> {
        let values: &[f32] = match self {
            Self::Point(p) => p,
            Self::Box(b) => b,
        };
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Pixel rectangle `[x0, y0, x1, y1)` covered in a buffer of the
    /// given region, clamped to the buffer. Points cover one pixel.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn pixel_bounds(&self, roi: &Roi) -> Option<[u32; 4]> {
        if roi.is_empty() {
            return None;
        }
        let w = roi.width as f32;
        let h = roi.height as f32;
        let to_px = |v: f32, extent: f32| (v.clamp(0.0, 1.0) * (extent - 1.0)).round() as u32;
        let bounds = match *self {
            Self::Point([x, y]) => {
                let px = to_px(x, w);
                let py = to_px(y, h);
                [px, py, px + 1, py + 1]
            }
            Self::Box([x0, y0, x1, y1]) => {
                let (x0, x1) = if x0 <= x1 { (x0, x1) } else { (x1, x0) };
                let (y0, y1) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
                [to_px(x0, w), to_px(y0, h), to_px(x1, w) + 1, to_px(y1, h) + 1]
            }
        };
        Some(bounds)
    }
}

/// A picker attached to one stage, sampling that stage's input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PickerRequest {
    /// Index of the stage in the pipeline.
    pub stage: usize,
    /// Sampled region.
    pub region: SampleRegion,
}

/// A persistent sample shown alongside the image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveSample {
    /// Sampled region of the display output.
    pub region: SampleRegion,
    /// Locked samples keep their last value and are not recomputed.
    pub locked: bool,
}

/// Shared flag a caller sets to abandon in-flight work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear a previous cancellation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything about a request besides the region itself.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    /// Stage with user focus, if any. Its operation-tag filter hides
    /// matching stages, and its input line is pinned in the cache.
    pub focused: Option<usize>,
    /// Active stage picker.
    pub picker: Option<PickerRequest>,
    /// Live samples on the display output (preview pipeline only).
    pub live_samples: Vec<LiveSample>,
    /// Restrict the display histogram to the primary picker's region.
    pub restrict_histogram: bool,
    /// Whether an interactive front end consumes statistics. Without
    /// one, no histograms or picks are collected.
    pub gui_attached: bool,
    /// Cancellation flag checked between stages.
    pub cancel: CancelToken,
}

impl ProcessContext {
    /// A context for headless runs: no focus, pickers, or statistics.
    #[must_use]
    pub fn headless() -> Self {
        Self::default()
    }

    /// A context for an interactive session that wants statistics.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            gui_attached: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn point_and_box_hash_differently() {
        let point = SampleRegion::Point([0.5, 0.5]);
        let boxed = SampleRegion::Box([0.5, 0.5, 0.5, 0.5]);
        assert_eq!(point.hash_bytes().len(), 8);
        assert_eq!(boxed.hash_bytes().len(), 16);
        assert_ne!(point.hash_bytes(), boxed.hash_bytes());
    }

    #[test]
    fn box_bounds_are_ordered_and_clamped() {
        let roi = Roi::new(0, 0, 11, 11, 1.0);
        let bounds = SampleRegion::Box([1.2, 0.5, -0.3, 0.0]).pixel_bounds(&roi).unwrap();
        assert_eq!(bounds, [0, 0, 11, 6]);
    }

    #[test]
    fn point_covers_one_pixel() {
        let roi = Roi::new(0, 0, 5, 5, 1.0);
        let bounds = SampleRegion::Point([0.5, 1.0]).pixel_bounds(&roi).unwrap();
        assert_eq!(bounds, [2, 4, 3, 5]);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
