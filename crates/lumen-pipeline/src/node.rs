//! A stage instance inside a pipeline, with the committed parameter
//! hash and the geometry recorded by the last dimension pass.

use tracing::warn;

use crate::blend::BlendParams;
use crate::hash;
use crate::roi::Roi;
use crate::stage::{Stage, StageCapabilities};

/// One pipeline slot: a stage plus its per-pipeline state.
pub struct StageNode {
    stage: Box<dyn Stage>,
    capabilities: StageCapabilities,
    enabled: bool,
    hash: u64,
    blend: BlendParams,
    /// Full input extent at scale 1.
    pub(crate) buf_in: Roi,
    /// Full output extent at scale 1.
    pub(crate) buf_out: Roi,
}

impl std::fmt::Debug for StageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageNode")
            .field("op", &self.stage.op())
            .field("enabled", &self.enabled)
            .field("hash", &self.hash)
            .field("blend", &self.blend)
            .finish_non_exhaustive()
    }
}

impl StageNode {
    /// Wrap a freshly created stage. The node starts with the stage's
    /// default enablement and a zero hash until parameters are committed.
    #[must_use]
    pub fn new(stage: Box<dyn Stage>) -> Self {
        let capabilities = stage.capabilities();
        let empty = Roi::new(0, 0, 0, 0, 1.0);
        Self {
            stage,
            capabilities,
            enabled: capabilities.default_enabled,
            hash: 0,
            blend: BlendParams::default(),
            buf_in: empty,
            buf_out: empty,
        }
    }

    /// Operation name.
    #[must_use]
    pub fn op(&self) -> &'static str {
        self.stage.op()
    }

    /// Whether the node participates in processing.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Hash of the committed parameters; 0 when disabled.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Committed blend parameters.
    #[must_use]
    pub const fn blend(&self) -> &BlendParams {
        &self.blend
    }

    /// Declared capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> StageCapabilities {
        self.capabilities
    }

    /// The stage itself.
    #[must_use]
    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    /// Full input and output extents from the last dimension pass.
    #[must_use]
    pub const fn extents(&self) -> (Roi, Roi) {
        (self.buf_in, self.buf_out)
    }

    /// Install parameters and recompute the node hash.
    ///
    /// The hash covers the parameter blob followed by the blend blob.
    /// Parameters are installed even when the node is switched off, so
    /// an empty blob resets the stage to its defaults. A blob the stage
    /// rejects disables the node so the pipeline keeps running with the
    /// rest of the chain.
    pub fn commit(&mut self, params: &[u8], blend: &[u8], enabled: bool) {
        let accepted = match self.stage.commit_params(params) {
            Ok(()) => true,
            Err(e) => {
                warn!(op = self.op(), error = %e, "rejected parameters, disabling stage");
                false
            }
        };
        self.enabled = enabled && accepted;
        self.blend = if self.capabilities.blending && self.enabled {
            BlendParams::decode(blend).unwrap_or_else(|e| {
                warn!(op = self.op(), error = %e, "rejected blend parameters, blending off");
                BlendParams::default()
            })
        } else {
            BlendParams::default()
        };
        self.hash = if self.enabled {
            hash::djb2_bytes(hash::djb2_bytes(hash::DJB2_SEED, params), blend)
        } else {
            0
        };
    }

    /// Back to default parameters and default enablement.
    pub fn reset(&mut self) {
        self.commit(&[], &[], self.capabilities.default_enabled);
    }

    /// Override enablement and hash for a single run; see
    /// [`Pipeline::process_no_gamma`](crate::Pipeline::process_no_gamma).
    pub(crate) const fn set_state(&mut self, enabled: bool, hash: u64) {
        self.enabled = enabled;
        self.hash = hash;
    }
}
