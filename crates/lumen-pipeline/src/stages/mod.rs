//! Builtin stages.
//!
//! Each stage decodes its parameter blob as JSON. An empty blob means
//! the stage defaults.

pub mod colorout;
pub mod crop;
pub mod exposure;
pub mod gamma;
pub mod levels;
pub mod lowpass;
pub mod tonecurve;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::roi::{CHANNELS, Roi};
use crate::types::StageError;

/// Serialize parameters into a blob for the history.
#[must_use]
pub fn encode_params<T: Serialize>(params: &T) -> Vec<u8> {
    serde_json::to_vec(params).unwrap_or_default()
}

pub(crate) fn decode_params<T: DeserializeOwned + Default>(
    op: &'static str,
    blob: &[u8],
) -> Result<T, StageError> {
    if blob.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(blob).map_err(|source| StageError::InvalidParams { op, source })
}

pub(crate) fn check_range(
    op: &'static str,
    field: &'static str,
    value: f32,
    ok: bool,
) -> Result<(), StageError> {
    if ok {
        Ok(())
    } else {
        Err(StageError::OutOfRange { op, field, value })
    }
}

/// Apply `f` to the RGB of every pixel, copying alpha.
pub(crate) fn map_pixels(input: &[f32], output: &mut [f32], f: impl Fn([f32; 3]) -> [f32; 3]) {
    for (src, dst) in input
        .chunks_exact(CHANNELS)
        .zip(output.chunks_exact_mut(CHANNELS))
    {
        let [r, g, b] = f([src[0], src[1], src[2]]);
        dst[0] = r;
        dst[1] = g;
        dst[2] = b;
        dst[3] = src[3];
    }
}

/// Copy the top-left overlap of two differently sized buffers, leaving
/// the rest of `output` black.
pub(crate) fn copy_aligned(input: &[f32], roi_in: &Roi, output: &mut [f32], roi_out: &Roi) {
    let w = roi_in.width.min(roi_out.width) as usize * CHANNELS;
    let rows = roi_in.height.min(roi_out.height) as usize;
    let out_len = roi_out.buffer_len().min(output.len());
    output[..out_len].fill(0.0);
    for row in 0..rows {
        let s = row * roi_in.width as usize * CHANNELS;
        let d = row * roi_out.width as usize * CHANNELS;
        if s + w > input.len() || d + w > output.len() {
            return;
        }
        output[d..d + w].copy_from_slice(&input[s..s + w]);
    }
}
