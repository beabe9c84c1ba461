//! Pipeline diagnostics: per-stage timing and where each stage ran.
//!
//! Every call to [`Pipeline::process`](crate::Pipeline::process)
//! records diagnostics for the stages it touched. The most recent set
//! is available from
//! [`Pipeline::last_diagnostics`](crate::Pipeline::last_diagnostics).
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::roi::Roi;
use crate::types::PipePurpose;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// How a stage's output was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Reused from the cache.
    CacheHit,
    /// The base image was imported (cropped and scaled).
    Imported,
    /// The base image was used directly.
    Passthrough,
    /// Computed on the host in one go.
    Host,
    /// Computed on the host tile by tile.
    HostTiled,
    /// Computed on the accelerator in one go.
    Device,
    /// Computed on the accelerator tile by tile.
    DeviceTiled,
    /// The accelerator failed; recomputed on the host.
    DeviceFallback,
}

impl StageOutcome {
    /// Short label for reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CacheHit => "cache hit",
            Self::Imported => "imported",
            Self::Passthrough => "passthrough",
            Self::Host => "host",
            Self::HostTiled => "host (tiled)",
            Self::Device => "device",
            Self::DeviceTiled => "device (tiled)",
            Self::DeviceFallback => "device -> host",
        }
    }
}

/// Diagnostics for one stage position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Position in the pipeline; 0 is the base image.
    pub position: usize,
    /// Operation name, or `"base"` for position 0.
    pub op: String,
    /// Where the output came from.
    pub outcome: StageOutcome,
    /// Region produced.
    pub roi: Roi,
    /// Wall-clock time spent producing the output, excluding upstream
    /// stages (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

/// Diagnostics collected from a single `process` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDiagnostics {
    /// Which pipeline ran.
    pub purpose: PipePurpose,
    /// Requested region.
    pub roi: Roi,
    /// Accelerator used, if any.
    pub accelerator: Option<String>,
    /// Records in the order stages finished (base first).
    pub stages: Vec<StageRecord>,
    /// Host-only restarts after an accelerator fault.
    pub restarts: u32,
    /// Total wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Cache counters after the run.
    pub cache: CacheStats,
}

impl ProcessDiagnostics {
    /// Number of stages served from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.count(StageOutcome::CacheHit)
    }

    /// Number of stages with the given outcome.
    #[must_use]
    pub fn count(&self, outcome: StageOutcome) -> usize {
        self.stages.iter().filter(|s| s.outcome == outcome).count()
    }

    /// Produce a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Purpose: {}  |  Region: {}x{} at ({}, {}) scale {}",
            self.purpose, self.roi.width, self.roi.height, self.roi.x, self.roi.y, self.roi.scale,
        ));
        lines.push(format!(
            "Accelerator: {}  |  Restarts: {}",
            self.accelerator.as_deref().unwrap_or("none"),
            self.restarts,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<4} {:<16} {:>10} {:>10}  {}",
            "Pos", "Stage", "Duration", "% Total", "Outcome"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for record in &self.stages {
            let ms = duration_ms(record.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            lines.push(format!(
                "{:<4} {:<16} {ms:>8.3}ms {pct:>9.1}%  {} {}x{}",
                record.position,
                record.op,
                record.outcome.label(),
                record.roi.width,
                record.roi.height,
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "Cache: {} queries, {} misses, hit rate {:.1}%",
            self.cache.queries,
            self.cache.misses,
            self.cache.hit_rate() * 100.0,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
