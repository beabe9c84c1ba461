//! Exposure and black-level adjustment.

use serde::{Deserialize, Serialize};

use super::{check_range, decode_params, map_pixels};
use crate::roi::Roi;
use crate::stage::{Stage, StageCapabilities};
use crate::types::{AcceleratorError, StageError};

/// Operation name.
pub const OP: &str = "exposure";

/// Exposure parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureParams {
    /// Exposure change in stops.
    pub ev: f32,
    /// Black level subtracted before scaling.
    pub black: f32,
}

/// Multiplies by `2^ev` after subtracting the black level.
#[derive(Debug, Default)]
pub struct Exposure {
    params: ExposureParams,
}

impl Exposure {
    fn apply(&self, input: &[f32], output: &mut [f32]) {
        let gain = self.params.ev.exp2();
        let black = self.params.black;
        map_pixels(input, output, |rgb| rgb.map(|v| (v - black) * gain));
    }
}

impl Stage for Exposure {
    fn op(&self) -> &'static str {
        OP
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            accelerator: true,
            tiling: true,
            blending: true,
            default_enabled: false,
        }
    }

    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError> {
        let p: ExposureParams = decode_params(OP, params)?;
        check_range(OP, "ev", p.ev, p.ev.is_finite() && p.ev.abs() <= 18.0)?;
        check_range(OP, "black", p.black, p.black.is_finite())?;
        self.params = p;
        Ok(())
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, _roi_out: &Roi) {
        self.apply(input, output);
    }

    fn process_device(
        &self,
        input: &[f32],
        output: &mut [f32],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), AcceleratorError> {
        self.apply(input, output);
        Ok(())
    }
}
