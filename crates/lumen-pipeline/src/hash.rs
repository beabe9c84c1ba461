//! Content hashes identifying intermediate results.
//!
//! A hash covers the image identity, every stage hash up to a position,
//! the active picker region of any stage in that prefix, and the
//! requested region. Equal hashes mean the cached buffer can stand in
//! for recomputation.

use crate::context::ProcessContext;
use crate::node::StageNode;
use crate::roi::Roi;
use crate::stage::OperationTags;

/// Starting value of every hash chain.
pub const DJB2_SEED: u64 = 5381;

/// Fold one value into a running hash: `(h << 5) + h ^ value`.
#[must_use]
pub const fn djb2_step(hash: u64, value: u64) -> u64 {
    (hash << 5).wrapping_add(hash) ^ value
}

/// Fold a byte string into a running hash.
#[must_use]
pub fn djb2_bytes(seed: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(seed, |h, &b| djb2_step(h, u64::from(b)))
}

/// The operation-tag filter of the focused stage, if any.
#[must_use]
pub fn focus_filter(nodes: &[StageNode], ctx: &ProcessContext) -> OperationTags {
    ctx.focused
        .and_then(|i| nodes.get(i))
        .map_or(OperationTags::NONE, |n| n.stage().operation_tags_filter())
}

/// Whether the node at `index` is hidden by the focused stage's filter.
#[must_use]
pub fn is_filtered(nodes: &[StageNode], index: usize, ctx: &ProcessContext) -> bool {
    let filter = focus_filter(nodes, ctx);
    nodes
        .get(index)
        .is_some_and(|n| n.stage().operation_tags().intersects(filter))
}

/// Hash of the result of the first `upto` nodes over `roi`.
///
/// Filtered nodes are left out; disabled nodes contribute their zero
/// hash so toggling a stage changes every downstream hash.
#[must_use]
pub fn compute_hash(
    image_id: u64,
    roi: &Roi,
    nodes: &[StageNode],
    upto: usize,
    ctx: &ProcessContext,
) -> u64 {
    let filter = focus_filter(nodes, ctx);
    let mut hash = DJB2_SEED.wrapping_add(image_id);
    for (k, node) in nodes.iter().take(upto).enumerate() {
        if node.stage().operation_tags().intersects(filter) {
            continue;
        }
        hash = djb2_step(hash, node.hash());
        if let Some(picker) = ctx.picker.as_ref().filter(|p| p.stage == k) {
            hash = djb2_bytes(hash, &picker.region.hash_bytes());
        }
    }
    djb2_bytes(hash, &roi.hash_bytes())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::context::{PickerRequest, SampleRegion};
    use crate::stages::crop::Crop;
    use crate::stages::exposure::Exposure;

    fn exposure(ev: f32) -> StageNode {
        let mut node = StageNode::new(Box::new(Exposure::default()));
        node.commit(format!(r#"{{"ev": {ev}}}"#).as_bytes(), b"", true);
        node
    }

    fn crop() -> StageNode {
        let mut node = StageNode::new(Box::new(Crop::default()));
        node.commit(br#"{"cx":0.1,"cy":0.1,"cw":0.9,"ch":0.9}"#, b"", true);
        node
    }

    #[test]
    fn djb2_matches_known_value() {
        // "a" = 97: (5381 * 33) ^ 97
        assert_eq!(djb2_bytes(DJB2_SEED, b"a"), (5381 * 33) ^ 97);
    }

    #[test]
    fn hash_ignores_nodes_past_position() {
        let roi = Roi::new(0, 0, 8, 8, 1.0);
        let ctx = ProcessContext::default();
        let a = vec![exposure(1.0), exposure(2.0)];
        let b = vec![exposure(1.0), exposure(3.0)];
        assert_eq!(compute_hash(1, &roi, &a, 1, &ctx), compute_hash(1, &roi, &b, 1, &ctx));
        assert_ne!(compute_hash(1, &roi, &a, 2, &ctx), compute_hash(1, &roi, &b, 2, &ctx));
    }

    #[test]
    fn hash_depends_on_image_and_roi() {
        let nodes = vec![exposure(1.0)];
        let ctx = ProcessContext::default();
        let roi = Roi::new(0, 0, 8, 8, 1.0);
        let moved = Roi::new(1, 0, 8, 8, 1.0);
        let base = compute_hash(1, &roi, &nodes, 1, &ctx);
        assert_ne!(base, compute_hash(2, &roi, &nodes, 1, &ctx));
        assert_ne!(base, compute_hash(1, &moved, &nodes, 1, &ctx));
    }

    #[test]
    fn picker_region_changes_hash_of_its_prefix() {
        let nodes = vec![exposure(1.0), exposure(2.0)];
        let roi = Roi::new(0, 0, 8, 8, 1.0);
        let plain = ProcessContext::default();
        let picking = ProcessContext {
            picker: Some(PickerRequest {
                stage: 1,
                region: SampleRegion::Point([0.5, 0.5]),
            }),
            ..ProcessContext::default()
        };
        assert_eq!(
            compute_hash(1, &roi, &nodes, 1, &plain),
            compute_hash(1, &roi, &nodes, 1, &picking)
        );
        assert_ne!(
            compute_hash(1, &roi, &nodes, 2, &plain),
            compute_hash(1, &roi, &nodes, 2, &picking)
        );
    }

    #[test]
    fn focused_crop_filters_itself_out() {
        let nodes = vec![crop(), exposure(1.0)];
        let roi = Roi::new(0, 0, 8, 8, 1.0);
        let focused = ProcessContext {
            focused: Some(0),
            ..ProcessContext::default()
        };
        assert!(is_filtered(&nodes, 0, &focused));
        assert!(!is_filtered(&nodes, 1, &focused));
        // With crop hidden the chain hashes like one without it.
        let a = compute_hash(3, &roi, &nodes, 2, &focused);
        let lone = vec![exposure(1.0)];
        assert_eq!(a, compute_hash(3, &roi, &lone, 1, &ProcessContext::default()));
        assert_ne!(a, compute_hash(3, &roi, &nodes, 2, &ProcessContext::default()));
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(id in any::<u64>(), x in -50i32..50, w in 1u32..500, ev in -4.0f32..4.0) {
            let nodes = vec![exposure(ev)];
            let roi = Roi::new(x, 0, w, w, 1.0);
            let ctx = ProcessContext::default();
            prop_assert_eq!(
                compute_hash(id, &roi, &nodes, 1, &ctx),
                compute_hash(id, &roi, &nodes, 1, &ctx)
            );
        }

        #[test]
        fn parameter_change_changes_hash(ev in -4.0f32..4.0, delta in 0.01f32..2.0) {
            let roi = Roi::new(0, 0, 16, 16, 1.0);
            let ctx = ProcessContext::default();
            let a = vec![exposure(ev)];
            let b = vec![exposure(ev + delta)];
            prop_assert_ne!(
                compute_hash(9, &roi, &a, 1, &ctx),
                compute_hash(9, &roi, &b, 1, &ctx)
            );
        }
    }
}
