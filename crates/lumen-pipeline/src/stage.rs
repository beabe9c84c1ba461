//! The processing-stage abstraction.
//!
//! A stage is an opaque pixel operation. The pipeline only knows what a
//! stage declares through this trait: how it maps regions, how much
//! memory it needs for tiling, and whether it can run on the
//! accelerator.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::roi::Roi;
use crate::types::{AcceleratorError, StageError};

/// Bit set classifying what an operation does to the image.
///
/// A focused stage may declare a filter; stages whose tags intersect it
/// are skipped while it has focus (e.g. a crop tool shows the uncropped
/// frame while it is being edited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OperationTags(u32);

impl OperationTags {
    /// No tags.
    pub const NONE: Self = Self(0);
    /// Moves pixels around (crop, rotate, lens correction).
    pub const DISTORT: Self = Self(1 << 0);
    /// Adds decoration outside the image content (borders, watermarks).
    pub const DECORATION: Self = Self(1 << 1);

    /// Whether any tag is shared.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for OperationTags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What the pipeline may do with a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct StageCapabilities {
    /// The stage has a device implementation.
    pub accelerator: bool,
    /// The stage may be run tile by tile.
    pub tiling: bool,
    /// The stage's output may be blended with its input.
    pub blending: bool,
    /// New nodes start enabled before any history is applied.
    pub default_enabled: bool,
}

/// The color space a stage expects its input in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingSpace {
    /// Scene-referred linear RGB.
    #[default]
    LinearRgb,
    /// Output-profile RGB before display encoding.
    OutputRgb,
    /// Display-encoded RGB.
    Display,
}

/// Memory a stage needs to run, used to plan tiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilingRequirements {
    /// Buffers of region size needed at once, input and output included.
    pub factor: f32,
    /// Fixed extra bytes independent of region size.
    pub overhead: usize,
    /// Context pixels each tile needs on every side.
    pub overlap: u32,
}

impl Default for TilingRequirements {
    fn default() -> Self {
        Self {
            factor: 2.0,
            overhead: 0,
            overlap: 0,
        }
    }
}

impl TilingRequirements {
    /// Bytes needed to process a region of `pixels` pixels in one go.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn bytes_for(&self, pixels: usize) -> usize {
        let buffers = (pixels * crate::roi::BYTES_PER_PIXEL) as f64 * f64::from(self.factor);
        buffers.ceil() as usize + self.overhead
    }
}

/// One pixel operation.
///
/// All buffers are interleaved RGBA `f32`, row-major, sized exactly to
/// their region.
pub trait Stage: Send {
    /// Operation name. Stable; used to match history items.
    fn op(&self) -> &'static str;

    /// Capabilities of this stage.
    fn capabilities(&self) -> StageCapabilities;

    /// Tags describing what this stage does.
    fn operation_tags(&self) -> OperationTags {
        OperationTags::NONE
    }

    /// Tags of other stages to skip while this one has focus.
    fn operation_tags_filter(&self) -> OperationTags {
        OperationTags::NONE
    }

    /// Color space expected on input.
    fn working_space(&self) -> WorkingSpace {
        WorkingSpace::LinearRgb
    }

    /// The output profile, for the stage that converts into it.
    fn output_profile(&self) -> Option<crate::collect::OutputProfile> {
        None
    }

    /// Install a parameter blob.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] if the blob cannot be decoded.
    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError>;

    /// The input region needed to produce `roi_out`. `full_in` is the
    /// full input extent at scale 1.
    fn modify_roi_in(&self, roi_out: &Roi, full_in: &Roi) -> Roi {
        let _ = full_in;
        *roi_out
    }

    /// The output extent produced from the full input extent `roi_in`.
    fn modify_roi_out(&self, roi_in: &Roi) -> Roi {
        *roi_in
    }

    /// Memory requirements for processing `roi_out` from `roi_in`.
    fn tiling(&self, roi_in: &Roi, roi_out: &Roi) -> TilingRequirements {
        let _ = (roi_in, roi_out);
        TilingRequirements::default()
    }

    /// Compute `output` for `roi_out` from `input` covering `roi_in`.
    fn process(&self, input: &[f32], output: &mut [f32], roi_in: &Roi, roi_out: &Roi);

    /// Whether the device implementation is usable right now.
    fn accelerator_ready(&self) -> bool {
        self.capabilities().accelerator
    }

    /// Device implementation. Runs inside an accelerator dispatch on
    /// device-resident buffers.
    ///
    /// # Errors
    ///
    /// Returns [`AcceleratorError`] if the kernel fails.
    fn process_device(
        &self,
        input: &[f32],
        output: &mut [f32],
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<(), AcceleratorError> {
        let _ = (input, output, roi_in, roi_out);
        Err(AcceleratorError::Unsupported)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tags_intersect() {
        let both = OperationTags::DISTORT | OperationTags::DECORATION;
        assert!(both.intersects(OperationTags::DISTORT));
        assert!(!OperationTags::DECORATION.intersects(OperationTags::DISTORT));
        assert!(!OperationTags::NONE.intersects(both));
    }

    #[test]
    fn tiling_bytes_scale_with_factor() {
        let req = TilingRequirements {
            factor: 3.0,
            overhead: 10,
            overlap: 0,
        };
        assert_eq!(req.bytes_for(2), 2 * 16 * 3 + 10);
    }
}
