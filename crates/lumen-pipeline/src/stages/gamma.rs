//! Final display clamp.
//!
//! The last stage of every chain. Its output line is pinned in the
//! cache because every redraw reads it.

use serde::{Deserialize, Serialize};

use super::{decode_params, map_pixels};
use crate::roi::Roi;
use crate::stage::{Stage, StageCapabilities, WorkingSpace};
use crate::types::StageError;

/// Operation name.
pub const OP: &str = "gamma";

/// Display clamp parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GammaParams {
    /// Leave out-of-range values alone instead of clamping them.
    pub unclamped: bool,
}

/// Clamps display values to `0.0..=1.0`.
#[derive(Debug, Default)]
pub struct Gamma {
    params: GammaParams,
}

impl Stage for Gamma {
    fn op(&self) -> &'static str {
        OP
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            accelerator: false,
            tiling: true,
            blending: false,
            default_enabled: true,
        }
    }

    fn working_space(&self) -> WorkingSpace {
        WorkingSpace::Display
    }

    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError> {
        self.params = decode_params(OP, params)?;
        Ok(())
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, _roi_out: &Roi) {
        if self.params.unclamped {
            map_pixels(input, output, |rgb| rgb);
        } else {
            map_pixels(input, output, |rgb| rgb.map(|v| v.clamp(0.0, 1.0)));
        }
    }
}
