//! lumen-pipeline: Cached, region-of-interest driven pixel pipeline
//! (sans-IO).
//!
//! A [`Pipeline`] evaluates an ordered chain of [`Stage`]s over one
//! [`BaseImage`]. Requests name a region of the final output; the
//! pipeline maps it back through every stage to find what each one
//! needs, and fills the chain from the base image forward.
//!
//! Every intermediate buffer is stored in a small [`CacheStore`] keyed
//! by a hash of the image, the requested region, and the parameters of
//! all stages up to that point. Re-requesting a region after changing
//! only a late stage reuses everything before it.
//!
//! Stages may run on an [`Accelerator`] when one is attached. Failures
//! fall back to the host, and a fault the pipeline cannot recover from
//! mid-run restarts the request once without the accelerator.
//!
//! This crate has **no I/O dependencies**: images come in as decoded
//! pixel buffers and leave as [`Frame`]s. File decoding and the command
//! line live in `lumen-bench`.

pub mod accelerator;
pub mod blend;
pub mod cache;
pub mod collect;
pub mod context;
pub mod diagnostics;
pub mod hash;
pub mod history;
pub mod node;
mod offload;
pub mod pipeline;
pub mod registry;
pub mod resample;
pub mod roi;
pub mod stage;
pub mod stages;
pub mod tiling;
pub mod types;
pub mod worker;

pub use accelerator::{Accelerator, DeviceBuffer, EmulatedDevice, FaultPlan};
pub use cache::{CacheStats, CacheStore};
pub use collect::{DisplayPick, Histogram, OutputProfile, PickedColor, StagePick, Statistics};
pub use context::{CancelToken, LiveSample, PickerRequest, ProcessContext, SampleRegion};
pub use diagnostics::{ProcessDiagnostics, StageOutcome, StageRecord};
pub use history::{Develop, History, HistoryItem, SessionFlags};
pub use pipeline::{PipeChange, Pipeline, ProcessPhase};
pub use registry::{StageDescriptor, StageRegistry};
pub use roi::Roi;
pub use stage::{OperationTags, Stage, StageCapabilities, TilingRequirements, WorkingSpace};
pub use types::{
    AbortReason, AcceleratorError, BaseImage, CacheError, ConfigError, Dimensions, Frame,
    PipePurpose, PipelineConfig, PipelineError, ProcessError, StageError,
};
pub use worker::{PipelineWorker, ProcessRequest, WorkerOutcome};
