//! lumen-bench: CLI tool for running the pixel pipeline on an image file
//! and printing per-stage diagnostics.
//!
//! Useful for:
//!
//! - Seeing which stages are recomputed and which come from the cache
//!   across repeated runs
//! - Comparing host and emulated-accelerator runs, including tiling
//!   under a small device memory budget
//! - Measuring per-stage durations for each pipeline purpose
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin lumen-bench -- [OPTIONS] <IMAGE_PATH>
//! ```
//!
//! Log output goes to stderr and is controlled by `RUST_LOG`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::hash::Hasher;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use lumen_pipeline::{
    BaseImage, Develop, EmulatedDevice, HistoryItem, PipePurpose, Pipeline, PipelineConfig,
    ProcessContext, ProcessDiagnostics, Roi, StageRegistry,
};
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Cached pixel pipeline runner and diagnostics for lumen.
///
/// Loads an image, builds a pipeline from a module list and edit
/// history, processes the requested region one or more times, and
/// prints per-stage timing and cache diagnostics.
#[derive(Parser)]
#[command(name = "lumen-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP, TIFF).
    image_path: PathBuf,

    /// Which pipeline to run.
    #[arg(long, value_enum, default_value_t = Purpose::Export)]
    purpose: Purpose,

    /// Edit history as a JSON file: `{"modules": [...], "items": [...]}`.
    ///
    /// Each item is `{"op": "...", "params": {...}, "blend": {...},
    /// "enabled": true}`. Without a file, a default module list with
    /// no edits is used.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Append an enabled edit, e.g. `--edit 'exposure={"ev": 1.0}'`.
    /// Repeatable; applied after the history file's items.
    #[arg(long = "edit", value_name = "OP=JSON")]
    edits: Vec<String>,

    /// Scale at which the whole image is requested.
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// Attach an emulated accelerator with this much memory (bytes).
    #[arg(long)]
    accelerator_budget: Option<usize>,

    /// Run once with the display clamp stage switched off.
    #[arg(long)]
    no_gamma: bool,

    /// Write the final frame to a PNG file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of runs. Runs after the first show cache reuse.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// The JSON must be a valid `PipelineConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Pipeline purpose selection.
#[derive(Clone, Copy, ValueEnum)]
enum Purpose {
    /// Interactive full-resolution view.
    Full,
    /// Small view feeding histograms and pickers.
    Preview,
    /// One-shot render for a file.
    Export,
}

impl From<Purpose> for PipePurpose {
    fn from(p: Purpose) -> Self {
        match p {
            Purpose::Full => Self::Full,
            Purpose::Preview => Self::Preview,
            Purpose::Export => Self::Export,
        }
    }
}

/// Modules used when no history file is given.
const DEFAULT_MODULES: &[&str] = &["exposure", "tonecurve", "lowpass", "colorout", "gamma"];

/// History file layout. Parameters are inline JSON rather than the
/// byte blobs the pipeline stores.
#[derive(Deserialize)]
struct HistoryFile {
    modules: Vec<String>,
    #[serde(default)]
    items: Vec<HistoryFileItem>,
}

#[derive(Deserialize)]
struct HistoryFileItem {
    op: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    blend: Option<serde_json::Value>,
    #[serde(default = "enabled_default")]
    enabled: bool,
}

const fn enabled_default() -> bool {
    true
}

fn to_blob(value: Option<&serde_json::Value>) -> Result<Vec<u8>, String> {
    value.map_or_else(
        || Ok(Vec::new()),
        |v| serde_json::to_vec(v).map_err(|e| format!("Error encoding parameters: {e}")),
    )
}

/// Parse an `OP=JSON` edit flag.
fn parse_edit(flag: &str) -> Result<HistoryItem, String> {
    let (op, json) = flag
        .split_once('=')
        .ok_or_else(|| format!("Edit {flag:?} is not of the form OP=JSON"))?;
    let params: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("Error parsing edit for {op}: {e}"))?;
    Ok(HistoryItem::new(op.trim(), to_blob(Some(&params))?))
}

/// Build the editing session from `--history` (or the default module
/// list) followed by the `--edit` flags.
fn develop_from_cli(cli: &Cli) -> Result<Develop, String> {
    let registry = Arc::new(StageRegistry::with_builtin_stages());
    let dev = match &cli.history {
        None => {
            let modules = DEFAULT_MODULES.iter().map(|m| (*m).to_owned()).collect();
            Develop::new(registry, modules)
        }
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
            let file: HistoryFile = serde_json::from_str(&text)
                .map_err(|e| format!("Error parsing {}: {e}", path.display()))?;
            let dev = Develop::new(registry, file.modules);
            for item in file.items {
                let mut entry = HistoryItem::new(item.op, to_blob(item.params.as_ref())?)
                    .with_blend(to_blob(item.blend.as_ref())?);
                if !item.enabled {
                    entry = entry.disabled();
                }
                dev.push(entry);
            }
            dev
        }
    };
    for flag in &cli.edits {
        dev.push(parse_edit(flag)?);
    }
    Ok(dev)
}

fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    let Some(json) = &cli.config_json else {
        return Ok(PipelineConfig::default());
    };
    serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"))
}

/// Stable id for an image file, derived from its contents.
fn image_id(bytes: &[u8]) -> u64 {
    let mut hasher = siphasher::sip::SipHasher13::new();
    hasher.write(bytes);
    hasher.finish()
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn requested_roi(width: u32, height: u32, scale: f32) -> Roi {
    Roi::new(
        0,
        0,
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
        scale,
    )
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = config_from_cli(cli)?;
    let dev = develop_from_cli(cli)?;

    let image_bytes = std::fs::read(&cli.image_path)
        .map_err(|e| format!("Error reading {}: {e}", cli.image_path.display()))?;
    let decoded = image::load_from_memory(&image_bytes)
        .map_err(|e| format!("Error decoding {}: {e}", cli.image_path.display()))?;
    let base = BaseImage::new(image_id(&image_bytes), decoded.to_rgba32f(), 1.0);
    let (width, height) = (base.image().width(), base.image().height());

    eprintln!(
        "Image: {} ({}x{}, {} bytes)",
        cli.image_path.display(),
        width,
        height,
        image_bytes.len(),
    );
    eprintln!("Config: {config:#?}");
    eprintln!("Modules: {}", dev.snapshot().modules.join(" -> "));
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut pipe = Pipeline::new(cli.purpose.into(), config).map_err(|e| format!("Pipeline error: {e}"))?;
    if let Some(budget) = cli.accelerator_budget {
        pipe = pipe.with_accelerator(Arc::new(EmulatedDevice::new(budget)));
    }
    pipe.create_nodes(&dev);
    pipe.synch_all(&dev);
    pipe.set_input(base);
    let dims = pipe.processed_dimensions();
    info!(width = dims.width, height = dims.height, "output dimensions");

    let roi = requested_roi(dims.width, dims.height, cli.scale);
    let ctx = ProcessContext::headless();
    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }
        let result = if cli.no_gamma {
            pipe.process_no_gamma(&dev, &ctx, roi)
        } else {
            pipe.process(&dev, &ctx, roi)
        };
        result.map_err(|e| format!("Pipeline error: {e}"))?;
        let diagnostics = pipe
            .last_diagnostics()
            .ok_or_else(|| "Pipeline produced no diagnostics".to_owned())?;

        if cli.json {
            let json = serde_json::to_string_pretty(&diagnostics)
                .map_err(|e| format!("Error serializing diagnostics: {e}"))?;
            println!("{json}");
        } else {
            println!("{}", diagnostics.report());
        }
        all_diagnostics.push(diagnostics);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if let Some(path) = &cli.output {
        let frame = pipe
            .backbuffer()
            .ok_or_else(|| "No frame was published".to_owned())?;
        frame
            .to_rgba8()
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| format!("Error writing {}: {e}", path.display()))?;
        eprintln!("Frame written to {} ({}x{})", path.display(), frame.width(), frame.height());
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }
    debug!("done");
    Ok(())
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[ProcessDiagnostics]) {
    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    let hits: usize = all_diagnostics.iter().map(ProcessDiagnostics::cache_hits).sum();
    let restarts: u32 = all_diagnostics.iter().map(|d| d.restarts).sum();
    println!("Cache hits: {hits}  |  Restarts: {restarts}");

    if let Some(last) = all_diagnostics.last() {
        println!(
            "Cache: {} queries, {} misses, hit rate {:.1}%",
            last.cache.queries,
            last.cache.misses,
            last.cache.hit_rate() * 100.0,
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn image_id_depends_on_content() {
        assert_eq!(image_id(b"abc"), image_id(b"abc"));
        assert_ne!(image_id(b"abc"), image_id(b"abd"));
    }

    #[test]
    fn requested_roi_scales_and_never_collapses() {
        let roi = requested_roi(100, 50, 0.5);
        assert_eq!((roi.width, roi.height), (50, 25));
        let tiny = requested_roi(1, 1, 0.1);
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn history_file_items_become_blobs() {
        let file: HistoryFile = serde_json::from_str(
            r#"{"modules": ["exposure", "gamma"],
                "items": [{"op": "exposure", "params": {"ev": 1.0}},
                          {"op": "gamma", "enabled": false}]}"#,
        )
        .unwrap();
        assert_eq!(file.items.len(), 2);
        assert!(file.items[0].enabled);
        assert!(!file.items[1].enabled);
        let blob = to_blob(file.items[0].params.as_ref()).unwrap();
        assert_eq!(blob, br#"{"ev":1.0}"#);
        assert!(to_blob(None).unwrap().is_empty());
    }

    #[test]
    fn edit_flags_become_history_items() {
        let item = parse_edit(r#"exposure={"ev": 1.5}"#).unwrap();
        assert_eq!(item.op, "exposure");
        assert!(item.enabled);
        assert_eq!(item.params, br#"{"ev":1.5}"#);
        assert!(parse_edit("exposure").is_err());
        assert!(parse_edit("exposure={").is_err());
    }

    #[test]
    fn default_session_uses_builtin_modules() {
        let cli = Cli::try_parse_from(["lumen-bench", "in.png", "--edit", r#"gamma={}"#]).unwrap();
        let dev = develop_from_cli(&cli).unwrap();
        let history = dev.snapshot();
        assert_eq!(history.modules, DEFAULT_MODULES);
        assert_eq!(history.items.len(), 1);
    }

    #[test]
    fn cli_parses_purpose_and_runs() {
        let cli = Cli::try_parse_from(["lumen-bench", "in.png", "--purpose", "preview", "--runs", "3"])
            .unwrap();
        assert!(matches!(cli.purpose, Purpose::Preview));
        assert_eq!(cli.runs, 3);
        assert!(config_from_cli(&cli).is_ok());
    }
}
