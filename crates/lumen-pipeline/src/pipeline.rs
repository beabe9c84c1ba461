//! The pixel pipeline: an ordered chain of stages over one base image,
//! evaluated backwards from a requested region with every intermediate
//! result cached.
//!
//! # Locking
//!
//! Three locks, always taken in this order when nested:
//!
//! 1. the session's history lock ([`Develop::lock_history`]),
//! 2. the busy lock guarding nodes, cache, and base image,
//! 3. the frame and statistics locks.
//!
//! A computation holds the busy lock only while it looks at or changes
//! shared state, including while a stage runs. Between stages it
//! releases the lock, so topology changes and teardown can get in; the
//! computation notices via the shutdown flag or the generation counter
//! and abandons the run.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accelerator::Accelerator;
use crate::cache::{CacheStats, CacheStore};
use crate::collect::{self, DisplayPick, OutputProfile, StagePick, Statistics};
use crate::context::{ProcessContext, SampleRegion};
use crate::diagnostics::{ProcessDiagnostics, StageOutcome, StageRecord};
use crate::hash::{compute_hash, focus_filter, is_filtered};
use crate::history::{Develop, History, HistoryItem};
use crate::node::StageNode;
use crate::offload::{self, BufferRef, OffloadError, Placement, StageJob};
use crate::resample;
use crate::roi::Roi;
use crate::stage::OperationTags;
use crate::stages::{colorout, gamma, levels, tonecurve};
use crate::types::{
    AbortReason, BaseImage, CacheError, Dimensions, Frame, PipePurpose, PipelineConfig,
    PipelineError, ProcessError,
};

/// Pending synchronization work, accumulated by
/// [`Pipeline::request_change`] and applied by [`Pipeline::change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipeChange(u8);

impl PipeChange {
    /// Nothing to do.
    pub const NONE: Self = Self(0);
    /// Only the newest history item changed.
    pub const TOP_CHANGED: Self = Self(1 << 0);
    /// The history changed arbitrarily.
    pub const SYNCH: Self = Self(1 << 1);
    /// The module list changed; rebuild every node.
    pub const REMOVE: Self = Self(1 << 2);

    /// Whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Whether nothing is pending.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PipeChange {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where the current computation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPhase {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// Mapping the output region back to a stage's input region.
    NegotiatingRoi,
    /// Importing the base image.
    ResolvingInput,
    /// Running a stage.
    Computing,
    /// Gathering histograms and picks.
    CollectingStats,
    /// The last run published a frame.
    Done,
    /// The last run stopped without a frame.
    Aborted,
}

struct PipeState {
    nodes: Vec<StageNode>,
    cache: CacheStore,
    input: Option<BaseImage>,
    shutdown: bool,
    /// Bumped whenever nodes, parameters, or the input change.
    generation: u64,
    phase: ProcessPhase,
    processed: Dimensions,
    diagnostics: Option<ProcessDiagnostics>,
}

/// Why a run stopped, before mapping to [`ProcessError`].
#[derive(Debug)]
enum Halt {
    Abort(AbortReason),
    NoInput,
    DeviceFault,
    Cache(CacheError),
}

impl From<CacheError> for Halt {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<Halt> for ProcessError {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::Abort(reason) => Self::Aborted(reason),
            Halt::NoInput => Self::NoInput,
            Halt::DeviceFault => Self::AcceleratorFault,
            Halt::Cache(e) => Self::Cache(e),
        }
    }
}

/// Clears the processing flag when a run ends, however it ends.
struct ProcessingFlag<'a>(&'a AtomicBool);

impl<'a> ProcessingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One pipeline instance.
pub struct Pipeline {
    purpose: PipePurpose,
    config: PipelineConfig,
    accelerator: Option<Arc<dyn Accelerator>>,
    busy: Mutex<PipeState>,
    backbuf: Mutex<Option<Frame>>,
    stats: Mutex<Statistics>,
    changed: AtomicU8,
    processing: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("purpose", &self.purpose)
            .field("config", &self.config)
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name().to_owned()))
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline with its cache allocated and no nodes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for invalid configuration or if the
    /// cache cannot be allocated.
    pub fn new(purpose: PipePurpose, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let lines = config.cache_lines_for(purpose);
        let cache = CacheStore::new(lines, config.line_bytes())?;
        debug!(%purpose, lines, "pipeline created");
        Ok(Self {
            purpose,
            config,
            accelerator: None,
            busy: Mutex::new(PipeState {
                nodes: Vec::new(),
                cache,
                input: None,
                shutdown: false,
                generation: 0,
                phase: ProcessPhase::Idle,
                processed: Dimensions::default(),
                diagnostics: None,
            }),
            backbuf: Mutex::new(None),
            stats: Mutex::new(Statistics::default()),
            changed: AtomicU8::new(0),
            processing: AtomicBool::new(false),
        })
    }

    /// Attach an accelerator. Preview pipelines never use it.
    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// What this pipeline is for.
    #[must_use]
    pub const fn purpose(&self) -> PipePurpose {
        self.purpose
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn lock_busy(&self) -> MutexGuard<'_, PipeState> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, Statistics> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backbuf(&self) -> MutexGuard<'_, Option<Frame>> {
        self.backbuf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ───── Input and topology ────────────────────────────────────────

    /// Hand the pipeline its base image. In-flight work is abandoned.
    pub fn set_input(&self, image: BaseImage) {
        let mut st = self.lock_busy();
        debug!(id = image.id(), width = image.image().width(), height = image.image().height(), "input set");
        st.input = Some(image);
        st.generation += 1;
        compute_dimensions(&mut st, OperationTags::NONE);
    }

    /// Build one node per module in the session's module list.
    pub fn create_nodes(&self, dev: &Develop) {
        let history = dev.lock_history();
        let mut st = self.lock_busy();
        create_nodes_locked(&mut st, dev, &history);
    }

    /// Tear down every node. Any computation in flight aborts at its
    /// next check.
    pub fn cleanup_nodes(&self) {
        let mut st = self.lock_busy();
        cleanup_nodes_locked(&mut st);
    }

    /// Reset every node to defaults and replay the history in effect.
    pub fn synch_all(&self, dev: &Develop) {
        let history = dev.lock_history();
        let mut st = self.lock_busy();
        synch_all_locked(&mut st, &history);
    }

    /// Apply only the newest history item.
    pub fn synch_top(&self, dev: &Develop) {
        let history = dev.lock_history();
        let mut st = self.lock_busy();
        synch_top_locked(&mut st, &history);
    }

    /// Record pending synchronization work.
    pub fn request_change(&self, change: PipeChange) {
        self.changed.fetch_or(change.0, Ordering::AcqRel);
    }

    /// Pending synchronization work.
    #[must_use]
    pub fn pending_change(&self) -> PipeChange {
        PipeChange(self.changed.load(Ordering::Acquire))
    }

    /// Apply pending synchronization work, then recompute dimensions.
    pub fn change(&self, dev: &Develop) {
        let history = dev.lock_history();
        let flags = PipeChange(self.changed.swap(0, Ordering::AcqRel));
        let mut st = self.lock_busy();
        if flags.contains(PipeChange::REMOVE) {
            cleanup_nodes_locked(&mut st);
            create_nodes_locked(&mut st, dev, &history);
            synch_all_locked(&mut st, &history);
            info!(purpose = %self.purpose, nodes = st.nodes.len(), "stage list rebuilt");
        } else if flags.contains(PipeChange::SYNCH) {
            synch_all_locked(&mut st, &history);
        } else if flags.contains(PipeChange::TOP_CHANGED) {
            synch_top_locked(&mut st, &history);
        }
        compute_dimensions(&mut st, OperationTags::NONE);
    }

    /// Walk the stages forward from a `width` x `height` input and
    /// record each stage's full input and output extents. Returns the
    /// final output extent.
    ///
    /// No stage is focused here; [`process`](Self::process) repeats the
    /// walk with its context's focus before resolving.
    pub fn get_dimensions(&self, width: u32, height: u32) -> Dimensions {
        let mut st = self.lock_busy();
        walk_dimensions(&mut st, Dimensions::new(width, height), OperationTags::NONE)
    }

    /// Output extent from the last dimension pass.
    #[must_use]
    pub fn processed_dimensions(&self) -> Dimensions {
        self.lock_busy().processed
    }

    /// Operation names of the current nodes, in order.
    #[must_use]
    pub fn node_ops(&self) -> Vec<&'static str> {
        self.lock_busy().nodes.iter().map(StageNode::op).collect()
    }

    /// Full input and output extents of every node.
    #[must_use]
    pub fn node_extents(&self) -> Vec<(Roi, Roi)> {
        self.lock_busy().nodes.iter().map(StageNode::extents).collect()
    }

    /// Drop every cached intermediate.
    pub fn flush_caches(&self) {
        self.lock_busy().cache.flush();
    }

    /// Tear the pipeline down: nodes, input, and published frame.
    pub fn shutdown(&self) {
        {
            let mut st = self.lock_busy();
            cleanup_nodes_locked(&mut st);
            st.input = None;
        }
        *self.lock_backbuf() = None;
        info!(purpose = %self.purpose, "pipeline shut down");
    }

    // ───── Outputs ───────────────────────────────────────────────────

    /// The last published frame.
    #[must_use]
    pub fn backbuffer(&self) -> Option<Frame> {
        self.lock_backbuf().clone()
    }

    /// Statistics from the last preview runs.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.lock_stats().clone()
    }

    /// Cache counters and line states.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.lock_busy().cache.stats()
    }

    /// Diagnostics of the last run that got far enough to record any.
    #[must_use]
    pub fn last_diagnostics(&self) -> Option<ProcessDiagnostics> {
        self.lock_busy().diagnostics.clone()
    }

    /// Phase of the current or last run.
    #[must_use]
    pub fn phase(&self) -> ProcessPhase {
        self.lock_busy().phase
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    // ───── Processing ────────────────────────────────────────────────

    /// Compute `roi` of the final output and publish it.
    ///
    /// On an accelerator fault the caches are flushed, the nodes are
    /// re-synchronized, and the run is repeated once on the host.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] without touching the published frame.
    pub fn process(&self, dev: &Develop, ctx: &ProcessContext, roi: Roi) -> Result<(), ProcessError> {
        let _processing = ProcessingFlag::raise(&self.processing);
        let started = Instant::now();
        let mut use_device = self.config.accelerator_enabled && self.purpose != PipePurpose::Preview;
        let mut restarts = 0;
        debug!(cache = ?self.cache_stats(), "cache state");
        loop {
            let accel = self
                .accelerator
                .as_deref()
                .filter(|_| use_device)
                .filter(|a| a.lock());
            if let Some(a) = accel {
                a.events_reset();
            }
            debug!(purpose = %self.purpose, ?roi, device = accel.is_some(), "processing");

            let mut run = match Run::start(self, dev, ctx, accel) {
                Ok(run) => run,
                Err(halt) => {
                    if let Some(a) = accel {
                        a.unlock();
                    }
                    self.lock_busy().phase = ProcessPhase::Aborted;
                    return Err(halt.into());
                }
            };
            let result = run.resolve_final(roi);
            let queue_failed = accel.is_some_and(|a| a.events_flush().is_err());
            if let Some(a) = accel {
                a.unlock();
            }

            if queue_failed || matches!(result, Err(Halt::DeviceFault)) {
                warn!(purpose = %self.purpose, restarts, "accelerator fault");
                self.lock_busy().phase = ProcessPhase::Aborted;
                if restarts > 0 || accel.is_none() {
                    return Err(ProcessError::AcceleratorFault);
                }
                restarts += 1;
                use_device = false;
                self.flush_caches();
                self.synch_all(dev);
                info!("retrying on host");
                continue;
            }

            let diagnostics = |st: &PipeState, stages| ProcessDiagnostics {
                purpose: self.purpose,
                roi,
                accelerator: accel.map(|a| a.name().to_owned()),
                stages,
                restarts,
                total_duration: started.elapsed(),
                cache: st.cache.stats(),
            };

            let slot = match result {
                Ok(slot) => slot,
                Err(halt) => {
                    let mut st = self.lock_busy();
                    st.phase = ProcessPhase::Aborted;
                    st.diagnostics = Some(diagnostics(&*st, run.records));
                    debug!(?halt, "processing stopped");
                    return Err(halt.into());
                }
            };

            {
                let mut st = self.lock_busy();
                if st.shutdown {
                    st.phase = ProcessPhase::Aborted;
                    return Err(ProcessError::Aborted(AbortReason::Shutdown));
                }
                if st.generation != run.generation {
                    st.phase = ProcessPhase::Aborted;
                    return Err(ProcessError::Aborted(AbortReason::StageListChanged));
                }
                let Some(pixels) =
                    offload::host_slice(&st.cache, st.input.as_ref(), slot, roi.buffer_len())
                else {
                    st.phase = ProcessPhase::Aborted;
                    return Err(ProcessError::NoInput);
                };
                let pixels: Arc<[f32]> = Arc::from(pixels);
                let hash = compute_hash(run.image_id, &roi, &st.nodes, st.nodes.len(), ctx);
                st.phase = ProcessPhase::Done;
                st.diagnostics = Some(diagnostics(&*st, std::mem::take(&mut run.records)));
                let frame = Frame::new(pixels, roi.width, roi.height, hash);
                debug!(hash = frame.hash(), "frame published");
                // Under the busy lock: a shutdown clears it or aborts us.
                *self.lock_backbuf() = Some(frame);
            }
            return Ok(());
        }
    }

    /// Like [`process`](Self::process) with the display clamp stage
    /// switched off for this run.
    ///
    /// # Errors
    ///
    /// See [`process`](Self::process).
    pub fn process_no_gamma(
        &self,
        dev: &Develop,
        ctx: &ProcessContext,
        roi: Roi,
    ) -> Result<(), ProcessError> {
        let saved = {
            let mut st = self.lock_busy();
            let generation = st.generation;
            st.nodes
                .iter_mut()
                .enumerate()
                .find(|(_, n)| n.op() == gamma::OP)
                .map(|(i, n)| {
                    let state = (n.enabled(), n.hash());
                    n.set_state(false, 0);
                    (i, state, generation)
                })
        };
        let result = self.process(dev, ctx, roi);
        if let Some((i, (enabled, hash), generation)) = saved {
            let mut st = self.lock_busy();
            if st.generation == generation
                && let Some(node) = st.nodes.get_mut(i)
            {
                node.set_state(enabled, hash);
            }
        }
        result
    }
}

// ───── State helpers (busy lock held) ────────────────────────────────

fn cleanup_nodes_locked(st: &mut PipeState) {
    st.shutdown = true;
    st.nodes.clear();
    st.generation += 1;
}

fn create_nodes_locked(st: &mut PipeState, dev: &Develop, history: &History) {
    st.nodes = history
        .modules
        .iter()
        .filter_map(|op| {
            let stage = dev.registry().create(op);
            if stage.is_none() {
                warn!(op, "unknown operation, skipping");
            }
            stage.map(StageNode::new)
        })
        .collect();
    st.shutdown = false;
    st.generation += 1;
    debug!(nodes = st.nodes.len(), "nodes created");
}

fn synch_all_locked(st: &mut PipeState, history: &History) {
    for node in &mut st.nodes {
        node.reset();
    }
    for item in history.active() {
        apply_item(st, item);
    }
    st.generation += 1;
}

fn synch_top_locked(st: &mut PipeState, history: &History) {
    if let Some(item) = history.top() {
        apply_item(st, item);
        st.generation += 1;
    }
}

fn apply_item(st: &mut PipeState, item: &HistoryItem) {
    match st.nodes.iter_mut().find(|n| n.op() == item.op) {
        Some(node) => node.commit(&item.params, &item.blend_params, item.enabled),
        None => debug!(op = item.op, "history item for a module not in the pipeline"),
    }
}

fn compute_dimensions(st: &mut PipeState, filter: OperationTags) {
    if let Some(dims) = st.input.as_ref().map(BaseImage::dimensions) {
        walk_dimensions(st, dims, filter);
    }
}

/// Nodes that are disabled or hidden by `filter` pass their extent
/// through unchanged, matching what the resolver skips.
fn walk_dimensions(st: &mut PipeState, input: Dimensions, filter: OperationTags) -> Dimensions {
    let mut roi = Roi::full(input);
    for node in &mut st.nodes {
        node.buf_in = roi;
        if node.enabled() && !node.stage().operation_tags().intersects(filter) {
            roi = node.stage().modify_roi_out(&roi);
        }
        node.buf_out = roi;
    }
    st.processed = roi.dimensions();
    st.processed
}

/// Extent of a full-frame region at `scale`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled_extent(full: &Roi, scale: f32) -> Dimensions {
    Dimensions::new(
        (full.width as f32 * scale).round() as u32,
        (full.height as f32 * scale).round() as u32,
    )
}

// ───── One run ───────────────────────────────────────────────────────

/// The state of one attempt at computing a region.
struct Run<'p> {
    pipe: &'p Pipeline,
    dev: &'p Develop,
    ctx: &'p ProcessContext,
    accel: Option<&'p dyn Accelerator>,
    generation: u64,
    image_id: u64,
    records: Vec<StageRecord>,
}

impl<'p> Run<'p> {
    fn start(
        pipe: &'p Pipeline,
        dev: &'p Develop,
        ctx: &'p ProcessContext,
        accel: Option<&'p dyn Accelerator>,
    ) -> Result<Self, Halt> {
        let mut st = pipe.lock_busy();
        if st.shutdown {
            return Err(Halt::Abort(AbortReason::Shutdown));
        }
        let image_id = st.input.as_ref().map(BaseImage::id).ok_or(Halt::NoInput)?;
        let filter = focus_filter(&st.nodes, ctx);
        compute_dimensions(&mut st, filter);
        st.phase = ProcessPhase::NegotiatingRoi;
        Ok(Self {
            pipe,
            dev,
            ctx,
            accel,
            generation: st.generation,
            image_id,
            records: Vec::new(),
        })
    }

    fn collecting(&self) -> bool {
        self.pipe.purpose == PipePurpose::Preview && self.ctx.gui_attached
    }

    /// Take the busy lock, failing if the pipeline is shutting down or
    /// was changed since the run started.
    fn lock_checked(&self) -> Result<MutexGuard<'p, PipeState>, Halt> {
        let st = self.pipe.lock_busy();
        if st.shutdown {
            return Err(Halt::Abort(AbortReason::Shutdown));
        }
        if st.generation != self.generation {
            return Err(Halt::Abort(AbortReason::StageListChanged));
        }
        Ok(st)
    }

    fn check_session(&self) -> Result<(), Halt> {
        let session = self.dev.session();
        let reason = if self.ctx.cancel.is_cancelled() {
            Some(AbortReason::Cancelled)
        } else if self.pipe.purpose == PipePurpose::Full && session.image_reloading() {
            Some(AbortReason::ImageSwapped)
        } else if self.pipe.purpose == PipePurpose::Preview && session.preview_loading() {
            Some(AbortReason::PreviewLoading)
        } else if session.leaving() {
            Some(AbortReason::SessionLeaving)
        } else {
            None
        };
        reason.map_or(Ok(()), |r| Err(Halt::Abort(r)))
    }

    /// Release device memory held by `placement` and fail with `halt`.
    fn bail<T>(&self, placement: Placement, halt: Halt) -> Result<T, Halt> {
        let mut st = self.pipe.lock_busy();
        placement.discard(&mut st.cache, self.accel);
        Err(halt)
    }

    fn record(&mut self, position: usize, op: &str, outcome: StageOutcome, roi: Roi, started: Instant) {
        self.records.push(StageRecord {
            position,
            op: op.to_owned(),
            outcome,
            roi,
            duration: started.elapsed(),
        });
    }

    /// Resolve the whole chain and bring the result to the host.
    fn resolve_final(&mut self, roi: Roi) -> Result<BufferRef, Halt> {
        let n = self.lock_checked()?.nodes.len();
        match self.resolve(roi, n)? {
            Placement::Host(slot) => Ok(slot),
            Placement::Both { slot, buffer } => {
                if let Some(accel) = self.accel {
                    accel.release(buffer);
                }
                Ok(slot)
            }
            Placement::Device { line, buffer } => {
                let mut st = self.pipe.lock_busy();
                let Some(accel) = self.accel else {
                    st.cache.invalidate(line);
                    return Err(Halt::DeviceFault);
                };
                let result = match st.cache.line_mut(line).get_mut(..roi.buffer_len()) {
                    Some(host) => accel.download(&buffer, host),
                    None => Err(crate::types::AcceleratorError::Transfer(
                        "output line too small".to_owned(),
                    )),
                };
                accel.release(buffer);
                match result {
                    Ok(()) => Ok(BufferRef::Line(line)),
                    Err(e) => {
                        warn!(error = %e, "copying final output to host failed");
                        st.cache.invalidate(line);
                        Err(Halt::DeviceFault)
                    }
                }
            }
        }
    }

    /// Step down past disabled and filtered nodes.
    fn effective_position(&self, mut pos: usize) -> Result<usize, Halt> {
        let st = self.lock_checked()?;
        while pos > 0 {
            let k = pos - 1;
            if st.nodes[k].enabled() && !is_filtered(&st.nodes, k, self.ctx) {
                break;
            }
            pos -= 1;
        }
        Ok(pos)
    }

    /// Produce the output of the first `pos` nodes over `roi_out`.
    fn resolve(&mut self, roi_out: Roi, pos: usize) -> Result<Placement, Halt> {
        let pos = self.effective_position(pos)?;
        let started = Instant::now();
        let size = roi_out.buffer_bytes();

        let hash = {
            let mut st = self.lock_checked()?;
            let hash = compute_hash(self.image_id, &roi_out, &st.nodes, pos, self.ctx);
            if st.cache.contains(hash) {
                let acquired = st.cache.acquire(hash, size, 0)?;
                if acquired.hit {
                    let op = if pos == 0 { "base" } else { st.nodes[pos - 1].op() };
                    drop(st);
                    self.record(pos, op, StageOutcome::CacheHit, roi_out, started);
                    let placement = Placement::Host(BufferRef::Line(acquired.line));
                    if pos > 0 {
                        self.collect_output(pos - 1, &roi_out, &placement)?;
                    }
                    return Ok(placement);
                }
                st.cache.invalidate(acquired.line);
            }
            self.check_session()?;
            hash
        };

        if pos == 0 {
            return self.import_base(roi_out, hash, started);
        }
        let index = pos - 1;

        let (roi_in, covered, op) = {
            let mut st = self.lock_checked()?;
            st.phase = ProcessPhase::NegotiatingRoi;
            let node = &st.nodes[index];
            let full_in = node.buf_in;
            let roi_in = node.stage().modify_roi_in(&roi_out, &full_in);
            let covered = if full_in.is_empty() {
                roi_in
            } else {
                roi_in.clamp_to(scaled_extent(&full_in, roi_in.scale))
            };
            (roi_in, covered, node.op())
        };

        let input = if covered == roi_in {
            self.resolve(roi_in, index)?
        } else {
            self.resolve_padded(&covered, &roi_in, index)?
        };
        let started = Instant::now();

        if let Err(halt) = self.collect_input(index, &roi_in, &input) {
            return self.bail(input, halt);
        }

        let output = {
            let mut st = match self.lock_checked() {
                Ok(st) => st,
                Err(halt) => return self.bail(input, halt),
            };
            st.phase = ProcessPhase::Computing;
            let weight = if op == gamma::OP {
                st.cache.important_weight()
            } else {
                0
            };
            let input_line = input.line();
            let line = match st.cache.acquire_protecting(hash, size, weight, input_line) {
                Ok(acquired) => acquired.line,
                Err(e) => {
                    input.discard(&mut st.cache, self.accel);
                    return Err(e.into());
                }
            };

            let state = &mut *st;
            let node = &state.nodes[index];
            let job = StageJob {
                stage: node.stage(),
                capabilities: node.capabilities(),
                blend: node.blend(),
                roi_in: &roi_in,
                roi_out: &roi_out,
            };
            let run = offload::run_stage(
                &job,
                &mut state.cache,
                state.input.as_ref(),
                self.accel,
                self.pipe.config.host_memory_limit,
                input,
                line,
            );
            let run = match run {
                Ok(run) => run,
                Err(e) => {
                    state.cache.invalidate(line);
                    return Err(match e {
                        OffloadError::DeviceFault => Halt::DeviceFault,
                        OffloadError::MissingBuffer => Halt::NoInput,
                    });
                }
            };

            if self.ctx.focused == Some(index)
                && let Some(id) = input_line
            {
                let pinned = state.cache.important_weight();
                state.cache.reweight(id, pinned);
            }
            drop(st);
            self.record(pos, op, run.outcome, roi_out, started);
            run.output
        };

        if let Err(halt) = self.collect_output(index, &roi_out, &output) {
            return self.bail(output, halt);
        }
        Ok(output)
    }

    /// Produce the output of the first `pos` nodes over `padded`, of
    /// which only `covered` lies inside the input. The rest is black.
    fn resolve_padded(
        &mut self,
        covered: &Roi,
        padded: &Roi,
        pos: usize,
    ) -> Result<Placement, Halt> {
        let inner = if covered.is_empty() {
            None
        } else {
            Some(self.resolve(*covered, pos)?)
        };
        let mut st = match self.lock_checked() {
            Ok(st) => st,
            Err(halt) => {
                return match inner {
                    Some(placement) => self.bail(placement, halt),
                    None => Err(halt),
                };
            }
        };
        let hash = compute_hash(self.image_id, padded, &st.nodes, pos, self.ctx);
        let protect = inner.as_ref().and_then(Placement::line);
        let line = match st.cache.acquire_protecting(hash, padded.buffer_bytes(), 0, protect) {
            Ok(acquired) => acquired.line,
            Err(e) => {
                if let Some(placement) = inner {
                    placement.discard(&mut st.cache, self.accel);
                }
                return Err(e.into());
            }
        };
        let state = &mut *st;
        offload::pad_into(
            &mut state.cache,
            state.input.as_ref(),
            self.accel,
            inner,
            covered,
            padded,
            line,
        )
        .map_err(|e| {
            state.cache.invalidate(line);
            match e {
                OffloadError::DeviceFault => Halt::DeviceFault,
                OffloadError::MissingBuffer => Halt::NoInput,
            }
        })
    }

    fn import_base(&mut self, roi_out: Roi, hash: u64, started: Instant) -> Result<Placement, Halt> {
        let mut st = self.lock_checked()?;
        st.phase = ProcessPhase::ResolvingInput;
        let dims = st.input.as_ref().map(BaseImage::dimensions).ok_or(Halt::NoInput)?;
        if roi_out.is_full_frame_of(dims) {
            drop(st);
            self.record(0, "base", StageOutcome::Passthrough, roi_out, started);
            return Ok(Placement::Host(BufferRef::Base));
        }
        let line = st.cache.acquire(hash, roi_out.buffer_bytes(), 0)?.line;
        let filter = self.pipe.config.resample_filter;
        let state = &mut *st;
        if let Some(base) = state.input.as_ref() {
            resample::clip_and_zoom(base, &roi_out, filter, state.cache.line_mut(line));
        }
        drop(st);
        self.record(0, "base", StageOutcome::Imported, roi_out, started);
        Ok(Placement::Host(BufferRef::Line(line)))
    }

    /// Statistics on a stage's input: pre-curve histograms and the
    /// stage picker.
    fn collect_input(&self, index: usize, roi_in: &Roi, input: &Placement) -> Result<(), Halt> {
        if !self.collecting() {
            return Ok(());
        }
        let Some(slot) = input.host() else {
            return Ok(());
        };
        let mut st = self.lock_checked()?;
        st.phase = ProcessPhase::CollectingStats;
        let node = &st.nodes[index];
        let op = node.op();
        let space = node.stage().working_space();
        let Some(buf) = offload::host_slice(&st.cache, st.input.as_ref(), slot, roi_in.buffer_len())
        else {
            return Ok(());
        };
        let stride = self.pipe.config.histogram_stride;
        let mut stats = self.pipe.lock_stats();
        if op == tonecurve::OP {
            stats.histogram_pre_tonecurve = collect::working_histogram(buf, roi_in, stride);
        } else if op == levels::OP {
            stats.histogram_pre_levels = collect::working_histogram(buf, roi_in, stride);
        }
        if let Some(picker) = self.ctx.picker.filter(|p| p.stage == index)
            && let Some(color) = collect::pick(buf, roi_in, &picker.region)
        {
            stats.stage_pick = Some(StagePick {
                stage: index,
                space,
                color,
            });
        }
        Ok(())
    }

    /// Statistics on the display output: live samples, the primary
    /// picker, and the histogram. Only at the display clamp stage.
    fn collect_output(&self, index: usize, roi_out: &Roi, output: &Placement) -> Result<(), Halt> {
        if !self.collecting() {
            return Ok(());
        }
        let Some(slot) = output.host() else {
            return Ok(());
        };
        let mut st = self.lock_checked()?;
        if st.nodes[index].op() != gamma::OP {
            return Ok(());
        }
        st.phase = ProcessPhase::CollectingStats;
        let profile = st
            .nodes
            .iter()
            .filter(|n| n.enabled())
            .find_map(|n| n.stage().output_profile());
        let primary = self.ctx.picker.filter(|p| {
            self.ctx.focused == Some(p.stage)
                && st.nodes.get(p.stage).is_some_and(|n| n.op() == colorout::OP)
        });
        let Some(buf) = offload::host_slice(&st.cache, st.input.as_ref(), slot, roi_out.buffer_len())
        else {
            return Ok(());
        };

        let mut stats = self.pipe.lock_stats();
        stats.live_samples.resize(self.ctx.live_samples.len(), None);
        for (i, sample) in self.ctx.live_samples.iter().enumerate() {
            if sample.locked {
                continue;
            }
            if let Some(pick) = display_pick(buf, roi_out, &sample.region, profile, stats.live_samples[i]) {
                stats.live_samples[i] = Some(pick);
            }
        }
        if let Some(picker) = primary
            && let Some(pick) = display_pick(buf, roi_out, &picker.region, profile, stats.primary_pick)
        {
            stats.primary_pick = Some(pick);
        }
        let bounds = if self.ctx.restrict_histogram {
            primary.and_then(|p| p.region.pixel_bounds(roi_out))
        } else {
            None
        };
        stats.histogram =
            collect::display_histogram(buf, roi_out, self.pipe.config.histogram_stride, bounds);
        Ok(())
    }
}

/// Pick `region` on the display output; a failed Lab conversion keeps
/// the previous Lab values.
fn display_pick(
    buf: &[f32],
    roi: &Roi,
    region: &SampleRegion,
    profile: Option<OutputProfile>,
    previous: Option<DisplayPick>,
) -> Option<DisplayPick> {
    let rgb = collect::pick_display(buf, roi, region)?;
    let lab = profile
        .and_then(|p| collect::display_pick_to_lab(p, &rgb))
        .or_else(|| previous.and_then(|p| p.lab));
    Some(DisplayPick { rgb, lab })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::StageRegistry;

    fn develop(modules: &[&str]) -> Develop {
        Develop::new(
            Arc::new(StageRegistry::with_builtin_stages()),
            modules.iter().map(|m| (*m).to_owned()).collect(),
        )
    }

    #[test]
    fn change_flags_combine() {
        let both = PipeChange::SYNCH | PipeChange::REMOVE;
        assert!(both.contains(PipeChange::REMOVE));
        assert!(!both.contains(PipeChange::TOP_CHANGED));
        assert!(!both.contains(PipeChange::NONE));
        assert!(PipeChange::NONE.is_empty());
    }

    #[test]
    fn too_few_cache_lines_is_rejected() {
        let config = PipelineConfig {
            cache_lines: Some(1),
            ..PipelineConfig::default()
        };
        assert!(Pipeline::new(PipePurpose::Full, config).is_err());
    }

    #[test]
    fn unknown_modules_are_skipped() {
        let dev = develop(&["exposure", "nonsense", "gamma"]);
        let pipe = Pipeline::new(PipePurpose::Export, PipelineConfig::default()).unwrap();
        pipe.create_nodes(&dev);
        assert_eq!(pipe.node_ops(), vec!["exposure", "gamma"]);
    }

    #[test]
    fn process_without_input_fails() {
        let dev = develop(&["gamma"]);
        let pipe = Pipeline::new(PipePurpose::Export, PipelineConfig::default()).unwrap();
        pipe.create_nodes(&dev);
        let err = pipe
            .process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 4, 1.0))
            .unwrap_err();
        assert_eq!(err, ProcessError::NoInput);
        assert!(pipe.backbuffer().is_none());
        assert_eq!(pipe.phase(), ProcessPhase::Aborted);
    }

    #[test]
    fn dimensions_follow_crop() {
        let dev = develop(&["crop", "gamma"]);
        dev.push(HistoryItem::new(
            "crop",
            br#"{"cx":0.0,"cy":0.0,"cw":0.5,"ch":0.25}"#.to_vec(),
        ));
        let pipe = Pipeline::new(PipePurpose::Full, PipelineConfig::default()).unwrap();
        pipe.create_nodes(&dev);
        pipe.synch_all(&dev);
        assert_eq!(pipe.get_dimensions(100, 80), Dimensions::new(50, 20));
        let extents = pipe.node_extents();
        assert_eq!(extents[0].0.width, 100);
        assert_eq!(extents[0].1.width, 50);
        assert_eq!(extents[1].0.width, 50);
    }

    #[test]
    fn synch_top_applies_only_newest_item() {
        let dev = develop(&["exposure", "gamma"]);
        let pipe = Pipeline::new(PipePurpose::Full, PipelineConfig::default()).unwrap();
        pipe.create_nodes(&dev);
        pipe.synch_all(&dev);
        let before = pipe.lock_busy().nodes[0].hash();
        dev.push(HistoryItem::new("exposure", br#"{"ev":0.5}"#.to_vec()));
        pipe.request_change(PipeChange::TOP_CHANGED);
        pipe.change(&dev);
        let st = pipe.lock_busy();
        assert!(st.nodes[0].enabled());
        assert_ne!(st.nodes[0].hash(), before);
    }

    #[test]
    fn remove_rebuilds_nodes_and_clears_shutdown() {
        let dev = develop(&["exposure", "gamma"]);
        let pipe = Pipeline::new(PipePurpose::Full, PipelineConfig::default()).unwrap();
        pipe.create_nodes(&dev);
        let generation = pipe.lock_busy().generation;
        dev.set_modules(vec!["gamma".to_owned()]);
        pipe.request_change(PipeChange::REMOVE);
        pipe.change(&dev);
        assert_eq!(pipe.node_ops(), vec!["gamma"]);
        let st = pipe.lock_busy();
        assert!(!st.shutdown);
        assert!(st.generation > generation);
        drop(st);
        assert!(pipe.pending_change().is_empty());
    }
}
