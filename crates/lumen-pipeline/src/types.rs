//! Shared types for the lumen development pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resample::ResampleFilter;
use crate::roi::CHANNELS;

/// Re-export `Rgba32FImage` so downstream crates can hand the pipeline
/// decoded pixels without depending on `image` directly.
pub use image::Rgba32FImage;

/// Re-export `RgbaImage` for 8-bit display output.
pub use image::RgbaImage;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// What a pipeline instance is for. Decides cache size, accelerator use,
/// and whether statistics are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipePurpose {
    /// Interactive full-resolution view of the region on screen.
    Full,
    /// Small whole-image view. Never uses the accelerator; feeds the
    /// histograms and color pickers.
    Preview,
    /// One-shot render for writing a file.
    Export,
}

impl PipePurpose {
    /// Number of cache lines used when the configuration does not say.
    #[must_use]
    pub const fn default_cache_lines(self) -> usize {
        match self {
            Self::Full | Self::Preview => PipelineConfig::DEFAULT_CACHE_LINES,
            Self::Export => PipelineConfig::DEFAULT_EXPORT_CACHE_LINES,
        }
    }
}

impl std::fmt::Display for PipePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Full => "full",
            Self::Preview => "preview",
            Self::Export => "export",
        };
        f.write_str(name)
    }
}

/// Configuration for a pipeline instance.
///
/// Every field has a default, so partial JSON documents deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of cache lines. `None` picks the purpose's default.
    pub cache_lines: Option<usize>,

    /// Width used to pre-size cache lines (pixels).
    pub line_width: u32,

    /// Height used to pre-size cache lines (pixels).
    pub line_height: u32,

    /// Whether the hardware accelerator may be used at all. Preview
    /// pipelines ignore this and always run on the host.
    pub accelerator_enabled: bool,

    /// Host memory budget per stage invocation before tiling kicks in
    /// for stages that allow it (bytes).
    pub host_memory_limit: usize,

    /// Filter used when importing the base image at a scale other
    /// than 1.
    pub resample_filter: ResampleFilter,

    /// Only every n-th pixel in each direction is sampled for
    /// histograms. Must be at least 1.
    pub histogram_stride: usize,
}

impl PipelineConfig {
    /// Cache lines for interactive pipelines.
    pub const DEFAULT_CACHE_LINES: usize = 5;

    /// Cache lines for export pipelines, which only ever need an input and
    /// an output buffer per stage.
    pub const DEFAULT_EXPORT_CACHE_LINES: usize = 2;

    /// Default width in pixels used to size fresh cache lines.
    pub const DEFAULT_LINE_WIDTH: u32 = 1024;

    /// Default height in pixels used to size fresh cache lines.
    pub const DEFAULT_LINE_HEIGHT: u32 = 1024;

    /// Default host memory a single stage invocation may use before the
    /// pipeline switches to tiled processing (bytes).
    pub const DEFAULT_HOST_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

    /// Default pixel stride used when sampling histograms.
    pub const DEFAULT_HISTOGRAM_STRIDE: usize = 4;
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_lines: None,
            line_width: Self::DEFAULT_LINE_WIDTH,
            line_height: Self::DEFAULT_LINE_HEIGHT,
            accelerator_enabled: true,
            host_memory_limit: Self::DEFAULT_HOST_MEMORY_LIMIT,
            resample_filter: ResampleFilter::default(),
            histogram_stride: Self::DEFAULT_HISTOGRAM_STRIDE,
        }
    }
}

impl PipelineConfig {
    /// Cache line count for a pipeline of the given purpose.
    #[must_use]
    pub fn cache_lines_for(&self, purpose: PipePurpose) -> usize {
        self.cache_lines
            .unwrap_or_else(|| purpose.default_cache_lines())
    }

    /// Size in bytes of a freshly allocated cache line.
    #[must_use]
    pub const fn line_bytes(&self) -> usize {
        self.line_width as usize * self.line_height as usize * crate::roi::BYTES_PER_PIXEL
    }

    /// Check the invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.histogram_stride == 0 {
            return Err(ConfigError::ZeroHistogramStride);
        }
        if let Some(lines) = self.cache_lines
            && lines < MIN_CACHE_LINES
        {
            return Err(ConfigError::TooFewCacheLines(lines));
        }
        Ok(())
    }
}

/// A pipeline resolves each stage's input while holding a line for its
/// output, so it needs at least two.
pub const MIN_CACHE_LINES: usize = 2;

/// The pipeline's input: a decoded image owned by the pipeline.
#[derive(Debug, Clone)]
pub struct BaseImage {
    id: u64,
    pixels: Rgba32FImage,
    scale: f32,
}

impl BaseImage {
    /// Wrap decoded pixels. `id` identifies the image in cache hashes;
    /// `scale` records how the pixels relate to the original raster and
    /// is informational only.
    #[must_use]
    pub const fn new(id: u64, pixels: Rgba32FImage, scale: f32) -> Self {
        Self { id, pixels, scale }
    }

    /// Build a base image from 8-bit RGBA pixels (values scaled to
    /// `0.0..=1.0`).
    #[must_use]
    pub fn from_rgba8(id: u64, pixels: &RgbaImage) -> Self {
        let converted = Rgba32FImage::from_fn(pixels.width(), pixels.height(), |x, y| {
            let p = pixels.get_pixel(x, y).0;
            image::Rgba(p.map(|c| f32::from(c) / 255.0))
        });
        Self::new(id, converted, 1.0)
    }

    /// Identity folded into every cache hash.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Scale recorded at construction.
    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }

    /// Pixel dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.pixels.width(), self.pixels.height())
    }

    /// Borrow the underlying image.
    #[must_use]
    pub const fn image(&self) -> &Rgba32FImage {
        &self.pixels
    }

    /// Interleaved RGBA samples, row-major.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        self.pixels.as_raw()
    }
}

/// The last successfully computed output of a pipeline.
///
/// Frames are immutable and cheap to clone; readers never observe a
/// half-written frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Arc<[f32]>,
    width: u32,
    height: u32,
    hash: u64,
}

impl Frame {
    pub(crate) fn new(pixels: Arc<[f32]>, width: u32, height: u32, hash: u64) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * CHANNELS);
        Self {
            pixels,
            width,
            height,
            hash,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Content hash of the stage chain that produced this frame.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Interleaved RGBA samples, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Quantize to 8-bit RGBA, clamping to the displayable range.
    #[must_use]
    pub fn to_rgba8(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let base = (y as usize * self.width as usize + x as usize) * CHANNELS;
            let mut px = [0u8; CHANNELS];
            for (c, out) in px.iter_mut().enumerate() {
                *out = quantize(self.pixels[base + c]);
            }
            image::Rgba(px)
        })
    }
}

/// Map a display-referred float to 8 bits.
#[must_use]
pub fn quantize(value: f32) -> u8 {
    // Clamped to [0, 255] before the cast.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let byte = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    byte
}

// ───── Errors ────────────────────────────────────────────────────────

/// Errors from the intermediate-result cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CacheError {
    /// The cache was asked for zero lines.
    #[error("cache needs at least one line")]
    NoLines,

    /// A line buffer could not be allocated.
    #[error("failed to allocate a cache line of {bytes} bytes")]
    Allocation {
        /// Requested size.
        bytes: usize,
    },
}

/// Errors a stage reports when it cannot accept a parameter blob.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The blob did not decode as this stage's parameters.
    #[error("invalid parameters for {op}: {source}")]
    InvalidParams {
        /// Operation name of the stage.
        op: &'static str,
        /// Decoder error.
        source: serde_json::Error,
    },

    /// The blob decoded but a value is out of range.
    #[error("parameter {field} of {op} out of range: {value}")]
    OutOfRange {
        /// Operation name of the stage.
        op: &'static str,
        /// Offending field.
        field: &'static str,
        /// Offending value.
        value: f32,
    },
}

/// Errors from the hardware accelerator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcceleratorError {
    /// Not enough device memory for the allocation.
    #[error("device out of memory ({requested} bytes requested, {available} available)")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes left in the budget.
        available: usize,
    },

    /// A host/device transfer failed.
    #[error("device transfer failed: {0}")]
    Transfer(String),

    /// A kernel failed to run.
    #[error("device kernel failed: {0}")]
    Kernel(String),

    /// The deferred command queue reported an error on flush.
    #[error("device queue reported an error")]
    Queue,

    /// The stage has no device implementation.
    #[error("stage has no device implementation")]
    Unsupported,

    /// A handle did not name a live device buffer.
    #[error("unknown device buffer {0}")]
    UnknownBuffer(u64),
}

/// Invalid [`PipelineConfig`] values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// `histogram_stride` was zero.
    #[error("histogram stride must be at least 1")]
    ZeroHistogramStride,

    /// `cache_lines` below the pipeline minimum.
    #[error("at least {MIN_CACHE_LINES} cache lines are required, got {0}")]
    TooFewCacheLines(usize),
}

/// Errors constructing a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// The configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),

    /// The cache could not be set up.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Why a computation stopped before producing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The pipeline is being torn down.
    Shutdown,
    /// The stage list or parameters changed while computing.
    StageListChanged,
    /// The full pipeline's image is being swapped.
    ImageSwapped,
    /// The preview pipeline's image is still loading.
    PreviewLoading,
    /// The editing session is ending.
    SessionLeaving,
    /// The caller cancelled the request.
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Shutdown => "pipeline shut down",
            Self::StageListChanged => "stage list changed",
            Self::ImageSwapped => "image swapped",
            Self::PreviewLoading => "preview still loading",
            Self::SessionLeaving => "session leaving",
            Self::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// Errors from [`Pipeline::process`](crate::Pipeline::process).
///
/// None of these touch the published frame; the previous one stays
/// visible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ProcessError {
    /// The computation was abandoned. Retry later.
    #[error("processing aborted: {0}")]
    Aborted(AbortReason),

    /// No base image has been set.
    #[error("pipeline has no input image")]
    NoInput,

    /// The accelerator failed and the host retry failed too.
    #[error("accelerator failure persisted after host retry")]
    AcceleratorFault,

    /// The cache could not provide a buffer.
    #[error(transparent)]
    Cache(#[from] CacheError),
}
