//! Blending a stage's output back over its input.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::roi::{CHANNELS, Roi};

/// How a stage's output is combined with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Output replaces input.
    #[default]
    Off,
    /// Linear mix by opacity.
    Normal,
    /// Input times output.
    Multiply,
    /// Per-channel maximum.
    Lighten,
    /// Per-channel minimum.
    Darken,
}

/// Per-stage blend settings, stored as their own history blob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendParams {
    /// Blend operator.
    pub mode: BlendMode,
    /// Strength in percent, `0.0..=100.0`.
    pub opacity: f32,
}

impl Default for BlendParams {
    fn default() -> Self {
        Self {
            mode: BlendMode::Off,
            opacity: 100.0,
        }
    }
}

impl BlendParams {
    /// Decode a blob. An empty blob means defaults.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for a malformed blob.
    pub fn decode(blob: &[u8]) -> Result<Self, serde_json::Error> {
        if blob.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(blob)
    }

    /// Serialize to a history blob.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Whether blending changes anything.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.mode != BlendMode::Off
    }
}

/// Blend `output` over `input` in place.
///
/// Blending needs input and output to cover the same pixels; otherwise
/// the output is left untouched. Alpha is taken from the output.
pub fn blend(params: &BlendParams, input: &[f32], output: &mut [f32], roi_in: &Roi, roi_out: &Roi) {
    if !params.is_active() {
        return;
    }
    if !roi_in.same_area(roi_out) {
        debug!(?roi_in, ?roi_out, "regions differ, skipping blend");
        return;
    }
    let opacity = (params.opacity / 100.0).clamp(0.0, 1.0);
    let len = roi_out.buffer_len().min(input.len()).min(output.len());
    for (src, dst) in input[..len]
        .chunks_exact(CHANNELS)
        .zip(output[..len].chunks_exact_mut(CHANNELS))
    {
        for c in 0..3 {
            let a = src[c];
            let b = dst[c];
            let mixed = match params.mode {
                BlendMode::Off | BlendMode::Normal => b,
                BlendMode::Multiply => a * b,
                BlendMode::Lighten => a.max(b),
                BlendMode::Darken => a.min(b),
            };
            dst[c] = a.mul_add(1.0 - opacity, mixed * opacity);
        }
    }
}
