//! Separable box blur.

use serde::{Deserialize, Serialize};

use super::{check_range, decode_params};
use crate::roi::{CHANNELS, Roi};
use crate::stage::{Stage, StageCapabilities, TilingRequirements};
use crate::types::{AcceleratorError, StageError};

/// Operation name.
pub const OP: &str = "lowpass";

/// Largest accepted radius.
pub const MAX_RADIUS: u32 = 64;

/// Blur parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowpassParams {
    /// Box radius in pixels at scale 1.
    pub radius: u32,
}

impl Default for LowpassParams {
    fn default() -> Self {
        Self { radius: 2 }
    }
}

/// Box blur with clamp-to-edge borders.
#[derive(Debug, Default)]
pub struct Lowpass {
    params: LowpassParams,
}

impl Lowpass {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn radius_at(&self, scale: f32) -> usize {
        (self.params.radius as f32 * scale).round().max(0.0) as usize
    }

    fn blur(&self, input: &[f32], output: &mut [f32], roi: &Roi) {
        let (w, h) = (roi.width as usize, roi.height as usize);
        let len = roi.buffer_len();
        if input.len() < len || output.len() < len || w == 0 || h == 0 {
            return;
        }
        let r = self.radius_at(roi.scale);
        let mut tmp = vec![0.0; len];
        box_pass(&input[..len], &mut tmp, w, h, r, 1, w);
        box_pass(&tmp, &mut output[..len], w, h, r, w, h);
    }
}

/// One blur pass along an axis. `step` is the pixel distance between
/// neighbours on the axis, `extent` the number of pixels along it.
#[allow(clippy::cast_precision_loss)]
fn box_pass(src: &[f32], dst: &mut [f32], w: usize, h: usize, r: usize, step: usize, extent: usize) {
    let norm = 1.0 / (2 * r + 1) as f32;
    for y in 0..h {
        for x in 0..w {
            let p = y * w + x;
            let pos = if step == 1 { x } else { y };
            let mut acc = [0.0f32; 3];
            for k in 0..=2 * r {
                let q = (pos + k).saturating_sub(r).min(extent - 1);
                let i = (p - pos * step + q * step) * CHANNELS;
                for c in 0..3 {
                    acc[c] += src[i + c];
                }
            }
            let o = p * CHANNELS;
            for c in 0..3 {
                dst[o + c] = acc[c] * norm;
            }
            dst[o + 3] = src[o + 3];
        }
    }
}

impl Stage for Lowpass {
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

    #[allow(clippy::cast_precision_loss)]
    fn commit_params(&mut self, params: &[u8]) -> Result<(), StageError> {
        let p: LowpassParams = decode_params(OP, params)?;
        check_range(OP, "radius", p.radius as f32, p.radius <= MAX_RADIUS)?;
        self.params = p;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn tiling(&self, _roi_in: &Roi, roi_out: &Roi) -> TilingRequirements {
        TilingRequirements {
            factor: 3.0,
            overhead: 0,
            overlap: self.radius_at(roi_out.scale) as u32,
        }
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, roi_out: &Roi) {
        self.blur(input, output, roi_out);
    }

    fn process_device(
        &self,
        input: &[f32],
        output: &mut [f32],
        _roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<(), AcceleratorError> {
        self.blur(input, output, roi_out);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_is_unchanged() {
        let stage = Lowpass::default();
        let roi = Roi::new(0, 0, 5, 3, 1.0);
        let input = [0.3, 0.6, 0.9, 1.0].repeat(roi.pixel_count());
        let mut output = vec![0.0; input.len()];
        stage.process(&input, &mut output, &roi, &roi);
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn impulse_spreads_evenly() {
        let mut stage = Lowpass::default();
        stage.commit_params(br#"{"radius": 1}"#).unwrap();
        let roi = Roi::new(0, 0, 3, 3, 1.0);
        let mut input = vec![0.0; roi.buffer_len()];
        input[4 * CHANNELS] = 9.0;
        let mut output = vec![0.0; input.len()];
        stage.process(&input, &mut output, &roi, &roi);
        for px in output.chunks_exact(CHANNELS) {
            assert!((px[0] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn overlap_follows_scaled_radius() {
        let mut stage = Lowpass::default();
        stage.commit_params(br#"{"radius": 8}"#).unwrap();
        let roi = Roi::new(0, 0, 10, 10, 0.5);
        assert_eq!(stage.tiling(&roi, &roi).overlap, 4);
    }

    #[test]
    fn radius_limit() {
        let mut stage = Lowpass::default();
        assert!(stage.commit_params(br#"{"radius": 65}"#).is_err());
    }
}
