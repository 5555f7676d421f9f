// src/schedule.rs
//! Pure scheduling helpers shared, unchanged, by the planner's analytic
//! simulation and the executor's real run.
//!
//! Per the Design Note in `spec.md` §9 ("planner replay"), duplicating the
//! forward/backward schedule between planner and executor is a known
//! hazard. Rather than a single opaque iterator, this module factors the
//! schedule into small pure functions of `(layer kinds, offload bitmap)`
//! — everything about *which* layer does *what* next is decided here once;
//! planner and executor only differ in *how* they carry each step out
//! (byte bookkeeping vs. real allocation/compute/copy).

use crate::registry::LayerKind;

/// One step of the forward pass: `primary` is the layer actually computed;
/// `fused_softmax`, when set, is a trailing Softmax layer whose forward is
/// folded into this step by aliasing its output to `primary`'s
/// (`spec.md` §4.4 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStep {
    pub primary: usize,
    pub fused_softmax: Option<usize>,
}

/// Walks `kinds` once, producing the forward-pass step sequence. A
/// Softmax layer with no preceding layer to fuse into (a degenerate
/// all-Activation/Softmax network, `kinds[0] == Softmax`) is left as its
/// own step — `spec.md` §9 documents this case as undefined, not a
/// panic.
pub fn forward_steps(kinds: &[LayerKind]) -> Vec<ForwardStep> {
    let mut steps = Vec::with_capacity(kinds.len());
    let mut i = 0;
    while i < kinds.len() {
        if i + 1 < kinds.len() && kinds[i + 1] == LayerKind::Softmax {
            steps.push(ForwardStep { primary: i, fused_softmax: Some(i + 1) });
            i += 2;
        } else {
            steps.push(ForwardStep { primary: i, fused_softmax: None });
            i += 1;
        }
    }
    steps
}

/// `spec.md` §3: during backward at layer `i`, `grad[i]` aliases
/// `grad[i+1]` (no allocation) iff layer `i+1` exists and is Activation
/// or Softmax.
#[inline]
pub fn aliases_next_grad(kinds: &[LayerKind], i: usize) -> bool {
    kinds.get(i + 1).is_some_and(|k| k.is_alias_kind())
}

/// The last layer eligible for offload is exempt (`spec.md` §4.3: "the
/// 'all'/'conv-only' offload policy marks every eligible layer ... except
/// the last such layer"). Scans from the tail; `None` for a degenerate
/// all-Activation/Softmax network (`spec.md` §9: undefined, not inferred).
pub fn last_offload_exempt(kinds: &[LayerKind]) -> Option<usize> {
    kinds.iter().rposition(|k| !k.is_alias_kind())
}

/// Which layers does an "all" or "conv-only" offload policy mark, given
/// the exemption above? Layer 0 is never marked: the forward schedule
/// never offloads it (`spec.md` §4.4 step 1, "if i > 0"; `activation[0]`
/// is the network's own input, not a layer's produced activation), so
/// marking it here would create an offload-sync wait with no worker ever
/// posted to it.
pub fn offload_bitmap(kinds: &[LayerKind], conv_only: bool) -> Vec<bool> {
    let exempt = last_offload_exempt(kinds);
    kinds
        .iter()
        .enumerate()
        .map(|(i, k)| {
            if i == 0 || Some(i) == exempt || k.is_alias_kind() {
                false
            } else if conv_only {
                *k == LayerKind::Convolution
            } else {
                true
            }
        })
        .collect()
}

/// `find_prefetch_layer(i)` (`spec.md` §4.3): scanning backward from `i`,
/// the nearest earlier layer marked for offload and not yet prefetched —
/// checked *before* the Convolution cutoff below, so an offloaded
/// Convolution layer is itself a valid (indeed the nearest) prefetch
/// target; it must be, since P3 requires every offloaded layer to be
/// reallocated exactly once via prefetch. Otherwise, stops (returns
/// `None`) if a non-offloaded Convolution layer is encountered first —
/// it will dominate backward latency, so there is nothing to usefully
/// overlap.
pub fn find_prefetch_layer(i: usize, kinds: &[LayerKind], offload: &[bool], prefetched: &[bool]) -> Option<usize> {
    let mut j = i;
    while j > 0 {
        j -= 1;
        if offload[j] && !prefetched[j] {
            return Some(j);
        }
        if kinds[j] == LayerKind::Convolution {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use LayerKind::*;

    #[test]
    fn forward_steps_fuse_trailing_softmax() {
        let kinds = [Convolution, Activation, Softmax];
        let steps = forward_steps(&kinds);
        assert_eq!(
            steps,
            vec![
                ForwardStep { primary: 0, fused_softmax: None },
                ForwardStep { primary: 1, fused_softmax: Some(2) },
            ]
        );
    }

    #[test]
    fn offload_bitmap_never_marks_layer_zero() {
        let kinds = [Convolution, Activation, Convolution, Activation, Convolution, Softmax];
        let bm = offload_bitmap(&kinds, false);
        // indices: 0 conv (layer 0, never offloaded), 1 act, 2 conv, 3 act,
        // 4 conv (last eligible, exempt), 5 softmax
        assert_eq!(bm, vec![false, false, true, false, false, false]);
    }

    #[test]
    fn offload_bitmap_exempts_last_eligible_layer() {
        let kinds = [Activation, Convolution, Activation, Convolution, Activation, Convolution, Softmax];
        let bm = offload_bitmap(&kinds, false);
        // index 0 (layer 0) is never offloaded despite being eligible;
        // index 5 (last eligible) is exempt as the layer feeding the loss.
        assert_eq!(bm, vec![false, true, false, true, false, false, false]);
    }

    #[test]
    fn conv_only_bitmap_marks_only_convolutions_minus_last_and_layer_zero() {
        let kinds = [Convolution, Activation, Convolution, Activation, Convolution, Softmax];
        let bm = offload_bitmap(&kinds, true);
        assert_eq!(bm, vec![false, false, true, false, false, false]);
    }

    #[test]
    fn find_prefetch_layer_returns_offloaded_conv_itself() {
        let kinds = [Convolution, Activation, Convolution, Activation];
        let offload = [true, false, true, false];
        let prefetched = [false, false, false, false];
        // Scanning back from 3: layer 2 is both Convolution and offloaded,
        // so it is itself the nearest prefetch target (P3: every offloaded
        // layer must be reallocated via prefetch).
        assert_eq!(find_prefetch_layer(3, &kinds, &offload, &prefetched), Some(2));
    }

    #[test]
    fn find_prefetch_layer_stops_at_non_offloaded_conv() {
        let kinds = [Convolution, Activation, Convolution, Activation];
        let offload = [true, false, false, false];
        let prefetched = [false, false, false, false];
        // Layer 2 is Convolution but not offloaded: it dominates backward
        // latency, so scanning stops before reaching the offloaded layer 0.
        assert_eq!(find_prefetch_layer(3, &kinds, &offload, &prefetched), None);
    }

    #[test]
    fn find_prefetch_layer_finds_nearest_offloaded_non_conv() {
        let kinds = [Activation, Convolution, Activation, Activation];
        let offload = [true, false, false, false];
        let prefetched = [false, false, false, false];
        assert_eq!(find_prefetch_layer(2, &kinds, &offload, &prefetched), None);
        // no conv between 3 and the offloaded candidate at 0? layer 1 is conv, so still None.
        assert_eq!(find_prefetch_layer(1, &kinds, &offload, &prefetched), Some(0));
    }
}
