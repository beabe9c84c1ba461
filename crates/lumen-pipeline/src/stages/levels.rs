//! Black, grey, and white point adjustment.

use serde::{Deserialize, Serialize};

use super::{check_range, decode_params, map_pixels};
use crate::roi::Roi;
use crate::stage::{Stage, StageCapabilities};
use crate::types::StageError;

/// Operation name.
pub const OP: &str = "levels";

/// Input points, `black < grey < white`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelsParams {
    /// Maps to 0.
    pub black: f32,
    /// Maps to 0.5.
    pub grey: f32,
    /// Maps to 1.
    pub white: f32,
}

impl Default for LevelsParams {
    fn default() -> Self {
        Self {
            black: 0.0,
            grey: 0.5,
            white: 1.0,
        }
    }
}

/// Rescales between black and white with a power curve through grey.
#[derive(Debug)]
pub struct Levels {
    params: LevelsParams,
    exponent: f32,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            params: LevelsParams::default(),
            exponent: 1.0,
        }
    }
}

impl Stage for Levels {
    fn op(&self) -> &'static str {
        OP
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            accelerator: false,
            tiling: true,
            blending: true,
            default_enabled: false,
        }
    }

    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError> {
        let p: LevelsParams = decode_params(OP, params)?;
        check_range(OP, "grey", p.grey, p.black < p.grey)?;
        check_range(OP, "white", p.white, p.grey < p.white)?;
        let mid = (p.grey - p.black) / (p.white - p.black);
        self.exponent = 0.5f32.ln() / mid.ln();
        self.params = p;
        Ok(())
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, _roi_out: &Roi) {
        let LevelsParams { black, white, .. } = self.params;
        let range = white - black;
        let exponent = self.exponent;
        map_pixels(input, output, |rgb| {
            rgb.map(|v| ((v - black) / range).max(0.0).powf(exponent))
        });
    }
}
