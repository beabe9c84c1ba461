//! Statistics gathered while the preview pipeline runs: histograms
//! and color picks.
//!
//! Everything here is best effort. A failed pick or conversion keeps
//! the previous value rather than failing the computation.

use serde::{Deserialize, Serialize};

use crate::context::SampleRegion;
use crate::roi::{CHANNELS, Roi};
use crate::stage::WorkingSpace;
use crate::types::quantize;

/// Histogram buckets per channel.
pub const HISTOGRAM_BINS: usize = 64;

/// Buckets below this index are ignored when finding the histogram
/// maximum, so a black border does not flatten the rest.
const MAX_SKIP_BINS: usize = 4;

/// Rec. 709 luminance weights.
const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// A 64-bucket histogram of red, green, blue, and a luminance channel,
/// stored as `ln(1 + count)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `[r, g, b, luminance]` per bucket.
    pub bins: Vec<[f32; 4]>,
    /// Largest luminance value above the lowest buckets.
    pub max: f32,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bins: vec![[0.0; 4]; HISTOGRAM_BINS],
            max: 0.0,
        }
    }
}

impl Histogram {
    /// Whether nothing was counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(|b| b.iter().all(|&v| v == 0.0))
    }
}

/// Output color profile used by the output conversion stage and by
/// display picks converted to Lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputProfile {
    /// sRGB primaries and transfer curve.
    #[default]
    Srgb,
    /// Adobe RGB (1998) primaries, gamma 563/256.
    AdobeRgb,
    /// Rec. 709 primaries, linear transfer.
    LinearRec709,
}

const ADOBE_GAMMA: f32 = 563.0 / 256.0;

impl OutputProfile {
    /// Encode a linear value with the profile's transfer curve.
    #[must_use]
    pub fn encode(self, linear: f32) -> f32 {
        match self {
            Self::Srgb => {
                if linear <= 0.003_130_8 {
                    linear * 12.92
                } else {
                    1.055f32.mul_add(linear.powf(1.0 / 2.4), -0.055)
                }
            }
            Self::AdobeRgb => linear.max(0.0).powf(1.0 / ADOBE_GAMMA),
            Self::LinearRec709 => linear,
        }
    }

    /// Decode an encoded value back to linear.
    #[must_use]
    pub fn decode(self, encoded: f32) -> f32 {
        match self {
            Self::Srgb => {
                if encoded <= 0.040_45 {
                    encoded / 12.92
                } else {
                    ((encoded + 0.055) / 1.055).powf(2.4)
                }
            }
            Self::AdobeRgb => encoded.max(0.0).powf(ADOBE_GAMMA),
            Self::LinearRec709 => encoded,
        }
    }

    /// Linear RGB to CIE XYZ (D65) for the profile's primaries.
    #[must_use]
    pub const fn to_xyz(self) -> [[f32; 3]; 3] {
        match self {
            Self::Srgb | Self::LinearRec709 => [
                [0.412_456_4, 0.357_576_1, 0.180_437_5],
                [0.212_672_9, 0.715_152_2, 0.072_175_0],
                [0.019_333_9, 0.119_192_0, 0.950_304_1],
            ],
            Self::AdobeRgb => [
                [0.576_730_9, 0.185_554_0, 0.188_185_2],
                [0.297_376_9, 0.627_349_1, 0.075_274_1],
                [0.027_034_3, 0.070_687_2, 0.991_108_5],
            ],
        }
    }

    /// Convert a display-encoded RGB triple (`0.0..=1.0`) to CIE Lab.
    ///
    /// Returns `None` if the result is not finite.
    #[must_use]
    pub fn display_to_lab(self, rgb: [f32; 3]) -> Option<[f32; 3]> {
        let linear = rgb.map(|v| self.decode(v));
        let m = self.to_xyz();
        let xyz: [f32; 3] = std::array::from_fn(|row| {
            m[row][0].mul_add(linear[0], m[row][1].mul_add(linear[1], m[row][2] * linear[2]))
        });
        let lab = xyz_to_lab(xyz);
        lab.iter().all(|v| v.is_finite()).then_some(lab)
    }
}

/// D65 reference white.
const WHITE: [f32; 3] = [0.950_47, 1.0, 1.088_83];

fn xyz_to_lab(xyz: [f32; 3]) -> [f32; 3] {
    const EPSILON: f32 = 216.0 / 24389.0;
    const KAPPA: f32 = 24389.0 / 27.0;
    let f = |t: f32| {
        if t > EPSILON {
            t.cbrt()
        } else {
            KAPPA.mul_add(t, 16.0) / 116.0
        }
    };
    let fx = f(xyz[0] / WHITE[0]);
    let fy = f(xyz[1] / WHITE[1]);
    let fz = f(xyz[2] / WHITE[2]);
    [116.0f32.mul_add(fy, -16.0), 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// Mean, minimum, and maximum of a sampled region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PickedColor {
    /// Per-channel mean.
    pub mean: [f32; 3],
    /// Per-channel minimum.
    pub min: [f32; 3],
    /// Per-channel maximum.
    pub max: [f32; 3],
}

impl PickedColor {
    fn map(self, f: impl Fn([f32; 3]) -> Option<[f32; 3]>) -> Option<Self> {
        Some(Self {
            mean: f(self.mean)?,
            min: f(self.min)?,
            max: f(self.max)?,
        })
    }
}

/// A pick on a stage's input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePick {
    /// Stage whose input was sampled.
    pub stage: usize,
    /// Color space the values are in.
    pub space: WorkingSpace,
    /// Sampled values.
    pub color: PickedColor,
}

/// A pick on the display output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayPick {
    /// 8-bit display RGB values (`0.0..=255.0`).
    pub rgb: PickedColor,
    /// The same values in CIE Lab, if they could be converted.
    pub lab: Option<PickedColor>,
}

/// Side-channel statistics published by the preview pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Display-output histogram.
    pub histogram: Histogram,
    /// Histogram of the tone-curve stage's input.
    pub histogram_pre_tonecurve: Histogram,
    /// Histogram of the levels stage's input.
    pub histogram_pre_levels: Histogram,
    /// Pick on the focused stage's input.
    pub stage_pick: Option<StagePick>,
    /// Primary display picker.
    pub primary_pick: Option<DisplayPick>,
    /// Live samples, index-aligned with the request's samples.
    pub live_samples: Vec<Option<DisplayPick>>,
}

/// Histogram of a working-space buffer, bucketed by `63 * value`.
#[must_use]
pub fn working_histogram(buf: &[f32], roi: &Roi, stride: usize) -> Histogram {
    let bucket = |v: f32| {
        // Clamped to [0, 63] before the cast.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let b = (v * 63.0).clamp(0.0, 63.0) as usize;
        b
    };
    accumulate(buf, roi, stride, None, |px| {
        let lum = LUMA[2].mul_add(px[2], LUMA[0].mul_add(px[0], LUMA[1] * px[1]));
        [bucket(px[0]), bucket(px[1]), bucket(px[2]), bucket(lum)]
    })
}

/// Histogram of a display buffer as 8-bit values shifted down to 64
/// buckets. The luminance channel is the per-pixel maximum.
#[must_use]
pub fn display_histogram(buf: &[f32], roi: &Roi, stride: usize, bounds: Option<[u32; 4]>) -> Histogram {
    accumulate(buf, roi, stride, bounds, |px| {
        let r = usize::from(quantize(px[0]) >> 2);
        let g = usize::from(quantize(px[1]) >> 2);
        let b = usize::from(quantize(px[2]) >> 2);
        [r, g, b, r.max(g).max(b)]
    })
}

#[allow(clippy::cast_possible_truncation)]
fn accumulate(
    buf: &[f32],
    roi: &Roi,
    stride: usize,
    bounds: Option<[u32; 4]>,
    bucket: impl Fn(&[f32]) -> [usize; 4],
) -> Histogram {
    let mut counts = vec![[0u32; 4]; HISTOGRAM_BINS];
    let [x0, y0, x1, y1] = bounds.unwrap_or([0, 0, roi.width, roi.height]);
    let (x1, y1) = (x1.min(roi.width), y1.min(roi.height));
    let stride = stride.max(1);
    for y in (y0 as usize..y1 as usize).step_by(stride) {
        for x in (x0 as usize..x1 as usize).step_by(stride) {
            let i = (y * roi.width as usize + x) * CHANNELS;
            let Some(px) = buf.get(i..i + CHANNELS) else {
                continue;
            };
            for (c, b) in bucket(px).into_iter().enumerate() {
                counts[b.min(HISTOGRAM_BINS - 1)][c] += 1;
            }
        }
    }
    let bins: Vec<[f32; 4]> = counts
        .iter()
        .map(|c| c.map(|n| f64::from(n).ln_1p() as f32))
        .collect();
    let max = bins[MAX_SKIP_BINS..]
        .iter()
        .map(|b| b[3])
        .fold(0.0f32, f32::max);
    Histogram { bins, max }
}

/// Mean/min/max of `region` in a working-space buffer.
#[must_use]
pub fn pick(buf: &[f32], roi: &Roi, region: &SampleRegion) -> Option<PickedColor> {
    sample(buf, roi, region, |v| v)
}

/// Mean/min/max of `region` in a display buffer as 8-bit values.
#[must_use]
pub fn pick_display(buf: &[f32], roi: &Roi, region: &SampleRegion) -> Option<PickedColor> {
    sample(buf, roi, region, |v| f32::from(quantize(v)))
}

/// Convert an 8-bit display pick to Lab with `profile`.
#[must_use]
pub fn display_pick_to_lab(profile: OutputProfile, rgb8: &PickedColor) -> Option<PickedColor> {
    rgb8.map(|c| profile.display_to_lab(c.map(|v| v / 255.0)))
}

#[allow(clippy::cast_precision_loss)]
fn sample(buf: &[f32], roi: &Roi, region: &SampleRegion, map: impl Fn(f32) -> f32) -> Option<PickedColor> {
    let [x0, y0, x1, y1] = region.pixel_bounds(roi)?;
    let mut sum = [0.0f64; 3];
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    let mut n = 0usize;
    for y in y0..y1.min(roi.height) {
        for x in x0..x1.min(roi.width) {
            let i = (y as usize * roi.width as usize + x as usize) * CHANNELS;
            let px = buf.get(i..i + 3)?;
            for c in 0..3 {
                let v = map(px[c]);
                sum[c] += f64::from(v);
                min[c] = min[c].min(v);
                max[c] = max[c].max(v);
            }
            n += 1;
        }
    }
    if n == 0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let mean = sum.map(|s| (s / n as f64) as f32);
    Some(PickedColor { mean, min, max })
}
