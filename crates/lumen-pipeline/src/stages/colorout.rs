//! Conversion from the linear working space into the output profile.

use serde::{Deserialize, Serialize};

use super::{decode_params, map_pixels};
use crate::collect::OutputProfile;
use crate::roi::Roi;
use crate::stage::{Stage, StageCapabilities, WorkingSpace};
use crate::types::StageError;

/// Operation name.
pub const OP: &str = "colorout";

/// Linear Rec. 709 to linear Adobe RGB (1998).
const REC709_TO_ADOBE: [[f32; 3]; 3] = [
    [0.715_2, 0.284_8, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.041_2, 0.958_8],
];

/// Output conversion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColoroutParams {
    /// Target profile.
    pub profile: OutputProfile,
}

/// Maps linear Rec. 709 into the output profile's primaries and
/// transfer curve.
#[derive(Debug, Default)]
pub struct Colorout {
    params: ColoroutParams,
}

impl Stage for Colorout {
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

    fn output_profile(&self) -> Option<OutputProfile> {
        Some(self.params.profile)
    }

    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError> {
        self.params = decode_params(OP, params)?;
        Ok(())
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, _roi_out: &Roi) {
        let profile = self.params.profile;
        map_pixels(input, output, |rgb| {
            let primaries = match profile {
                OutputProfile::AdobeRgb => {
                    let m = REC709_TO_ADOBE;
                    std::array::from_fn(|row| {
                        m[row][0].mul_add(rgb[0], m[row][1].mul_add(rgb[1], m[row][2] * rgb[2]))
                    })
                }
                OutputProfile::Srgb | OutputProfile::LinearRec709 => rgb,
            };
            primaries.map(|v| profile.encode(v))
        });
    }

    fn working_space(&self) -> WorkingSpace {
        WorkingSpace::LinearRgb
    }
}
