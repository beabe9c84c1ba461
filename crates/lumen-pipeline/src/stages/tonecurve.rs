//! Contrast curve around a pivot.

use serde::{Deserialize, Serialize};

use super::{check_range, decode_params, map_pixels};
use crate::roi::Roi;
use crate::stage::{Stage, StageCapabilities};
use crate::types::StageError;

/// Operation name.
pub const OP: &str = "tonecurve";

/// Curve parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TonecurveParams {
    /// Contrast, greater than -1. Zero is the identity.
    pub contrast: f32,
    /// Value left unchanged by the curve.
    pub pivot: f32,
}

impl Default for TonecurveParams {
    fn default() -> Self {
        Self {
            contrast: 0.0,
            pivot: 0.18,
        }
    }
}

/// `pivot * (v / pivot)^(1 + contrast)`.
#[derive(Debug, Default)]
pub struct Tonecurve {
    params: TonecurveParams,
}

impl Stage for Tonecurve {
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
        let p: TonecurveParams = decode_params(OP, params)?;
        check_range(OP, "contrast", p.contrast, p.contrast > -1.0)?;
        check_range(OP, "pivot", p.pivot, p.pivot > 0.0)?;
        self.params = p;
        Ok(())
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, _roi_out: &Roi) {
        let TonecurveParams { contrast, pivot } = self.params;
        let exponent = 1.0 + contrast;
        map_pixels(input, output, |rgb| {
            rgb.map(|v| pivot * (v.max(0.0) / pivot).powf(exponent))
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pivot_is_fixed_point() {
        let mut stage = Tonecurve::default();
        stage.commit_params(br#"{"contrast": 0.5, "pivot": 0.25}"#).unwrap();
        let roi = Roi::new(0, 0, 1, 1, 1.0);
        let mut out = [0.0; 4];
        stage.process(&[0.25, 0.5, 0.1, 1.0], &mut out, &roi, &roi);
        assert!((out[0] - 0.25).abs() < 1e-6);
        assert!(out[1] > 0.5);
        assert!(out[2] < 0.1);
    }
}
