//! Rectangular crop.

use serde::{Deserialize, Serialize};

use super::{check_range, copy_aligned, decode_params};
use crate::roi::Roi;
use crate::stage::{OperationTags, Stage, StageCapabilities};
use crate::types::StageError;

/// Operation name.
pub const OP: &str = "crop";

/// Crop box as fractions of the input: left, top, right, bottom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropParams {
    /// Left edge.
    pub cx: f32,
    /// Top edge.
    pub cy: f32,
    /// Right edge.
    pub cw: f32,
    /// Bottom edge.
    pub ch: f32,
}

impl Default for CropParams {
    fn default() -> Self {
        Self {
            cx: 0.0,
            cy: 0.0,
            cw: 1.0,
            ch: 1.0,
        }
    }
}

/// Keeps a sub-rectangle of the image.
///
/// While focused it hides every distorting stage, itself included, so
/// the whole frame is visible for editing.
#[derive(Debug, Default)]
pub struct Crop {
    params: CropParams,
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled(fraction: f32, extent: u32, scale: f32) -> u32 {
    (fraction * extent as f32 * scale).round().max(0.0) as u32
}

impl Stage for Crop {
    fn op(&self) -> &'static str {
        OP
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::default()
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::DISTORT
    }

    fn operation_tags_filter(&self) -> OperationTags {
        OperationTags::DISTORT
    }

    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError> {
        let p: CropParams = decode_params(OP, params)?;
        check_range(OP, "cx", p.cx, (0.0..1.0).contains(&p.cx))?;
        check_range(OP, "cy", p.cy, (0.0..1.0).contains(&p.cy))?;
        check_range(OP, "cw", p.cw, p.cw > p.cx && p.cw <= 1.0)?;
        check_range(OP, "ch", p.ch, p.ch > p.cy && p.ch <= 1.0)?;
        self.params = p;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn modify_roi_in(&self, roi_out: &Roi, full_in: &Roi) -> Roi {
        let dx = scaled(self.params.cx, full_in.width, roi_out.scale);
        let dy = scaled(self.params.cy, full_in.height, roi_out.scale);
        Roi {
            x: roi_out.x + dx as i32,
            y: roi_out.y + dy as i32,
            ..*roi_out
        }
    }

    fn modify_roi_out(&self, roi_in: &Roi) -> Roi {
        let p = &self.params;
        Roi {
            x: 0,
            y: 0,
            width: scaled(p.cw - p.cx, roi_in.width, 1.0).max(1),
            height: scaled(p.ch - p.cy, roi_in.height, 1.0).max(1),
            scale: roi_in.scale,
        }
    }

    fn process(&self, input: &[f32], output: &mut [f32], roi_in: &Roi, roi_out: &Roi) {
        copy_aligned(input, roi_in, output, roi_out);
    }
}
