// src/planner.rs
//! The memory planner (`spec.md` §4.3): picks an offload set and
//! convolution-algorithm discipline that makes a network trainable
//! within the device budget, minimizing expected peak residency.
//!
//! Both planning phases — analytic simulation and allocator confirmation
//! — walk the exact same forward/backward schedule via the pure helpers
//! in `schedule.rs`, differing only in the capacity bound they replay
//! against (Design Note, `spec.md` §9, "planner replay").

use log::{debug, info};

use crate::accel::{Accelerator, Direction};
use crate::config::{AlgoPreference, NetworkConfig, PlannerPolicy};
use crate::error::{Error, Result};
use crate::registry::{LayerKind, LayerRegistry};
use crate::schedule;

/// The planner's output (`spec.md` §3): which layers are offloaded, the
/// convolution-algorithm preference and hard/soft discipline that made
/// the plan confirm, and the device-pool capacity it was sized to.
#[derive(Debug, Clone)]
pub struct Plan {
    pub offload: Vec<bool>,
    pub algo_pref: AlgoPreference,
    pub hard: bool,
    pub peak_bytes: u64,
}

impl Plan {
    #[inline]
    pub fn is_offloaded(&self, layer: usize) -> bool {
        self.offload.get(layer).copied().unwrap_or(false)
    }

    /// A short diagnostic line naming the tier a `dynamic` search settled
    /// on (`spec.md` §8 scenario 4).
    pub fn describe(&self) -> String {
        let tier = match (self.offload.iter().any(|&o| o), self.offload.iter().all(|&o| !o)) {
            (_, true) => "none",
            (true, false) if self.offload.iter().filter(|&&o| o).count() == self.offload.len().saturating_sub(1) => "all",
            _ => "conv-only",
        };
        format!(
            "offload={tier} algo={:?} discipline={} peak_bytes={}",
            self.algo_pref,
            if self.hard { "hard" } else { "soft" },
            self.peak_bytes
        )
    }
}

#[derive(Clone, Copy)]
enum OffloadKind {
    None,
    ConvOnly,
    All,
}

#[derive(Debug, Clone, Copy)]
enum AlgoSel {
    Configured,
    Performance,
    Memory,
}

/// `choose_plan`'s fixed 8-row priority table (`spec.md` §4.3), in order.
const TABLE: [(OffloadKind, AlgoSel, bool); 8] = [
    (OffloadKind::All, AlgoSel::Configured, true),
    (OffloadKind::None, AlgoSel::Performance, true),
    (OffloadKind::ConvOnly, AlgoSel::Performance, true),
    (OffloadKind::All, AlgoSel::Performance, true),
    (OffloadKind::ConvOnly, AlgoSel::Performance, false),
    (OffloadKind::All, AlgoSel::Performance, false),
    (OffloadKind::ConvOnly, AlgoSel::Memory, true),
    (OffloadKind::All, AlgoSel::Memory, true),
];

/// A pure byte-counting stand-in for the `Suballocator`, used only for
/// planning. It tracks aggregate live bytes, not byte ranges, so it
/// cannot detect fragmentation the real first-fit free list might hit —
/// an accepted simplification (see `DESIGN.md`): the planner assumes a
/// non-fragmenting allocator, which holds for this crate's single
/// straight-line schedule (every allocation's lifetime is a simple
/// nested/sequential span, never an arbitrary interleaving).
struct DryRunPool {
    capacity: Option<u64>,
    consumed: u64,
    max_consumed: u64,
}

impl DryRunPool {
    fn new(capacity: Option<u64>) -> Self {
        Self { capacity, consumed: 0, max_consumed: 0 }
    }

    fn free_bytes(&self) -> u64 {
        match self.capacity {
            Some(cap) => cap.saturating_sub(self.consumed),
            None => u64::MAX - self.consumed,
        }
    }

    #[must_use]
    fn alloc(&mut self, bytes: u64) -> bool {
        let next = self.consumed + bytes;
        if let Some(cap) = self.capacity {
            if next > cap {
                return false;
            }
        }
        self.consumed = next;
        self.max_consumed = self.max_consumed.max(self.consumed);
        true
    }

    fn free(&mut self, bytes: u64) {
        self.consumed = self.consumed.saturating_sub(bytes);
    }
}

/// Walks the full forward+backward schedule once, tracking device-byte
/// consumption, mirroring `spec.md` §4.4 step by step. `capacity` bounds
/// the dry-run pool; `None` means "assume the pool is large enough" (used
/// to discover each candidate's unconstrained algorithm choice before the
/// real, budget-bounded pass decides feasibility).
pub(crate) fn simulate(
    registry: &LayerRegistry,
    accel: &dyn Accelerator,
    offload: &[bool],
    algo_pref: AlgoPreference,
    hard: bool,
    param_bytes: u64,
    capacity: Option<u64>,
) -> Option<u64> {
    let kinds: Vec<LayerKind> = (0..registry.len()).map(|i| registry.kind(i)).collect();
    let l = kinds.len();
    let mut pool = DryRunPool::new(capacity);

    if !pool.alloc(param_bytes) {
        return None;
    }
    if !pool.alloc(registry.activation_bytes(0)) {
        return None;
    }

    for step in schedule::forward_steps(&kinds) {
        let i = step.primary;
        if !pool.alloc(registry.activation_bytes(i + 1)) {
            return None;
        }

        let mut ws = 0u64;
        if kinds[i] == LayerKind::Convolution {
            let free = pool.free_bytes();
            ws = registry.workspace_bytes(accel, i, Direction::Forward, algo_pref, hard, free)?;
            if !pool.alloc(ws) {
                return None;
            }
        }
        if ws > 0 {
            pool.free(ws);
        }

        if i > 0 && offload[i] {
            pool.free(registry.activation_bytes(i));
        }
    }

    if !pool.alloc(registry.activation_bytes(l)) {
        return None;
    }

    let mut prefetched = vec![false; l];
    for i in (0..l).rev() {
        if i > 0 {
            if !schedule::aliases_next_grad(&kinds, i) && !pool.alloc(registry.activation_bytes(i)) {
                return None;
            }
            if let Some(j) = schedule::find_prefetch_layer(i, &kinds, offload, &prefetched) {
                if !pool.alloc(registry.activation_bytes(j)) {
                    return None;
                }
                prefetched[j] = true;
            }
        }

        let mut ws = 0u64;
        if kinds[i] == LayerKind::Convolution {
            let free = pool.free_bytes();
            let bwd_filter = registry.workspace_bytes(accel, i, Direction::BackwardFilter, algo_pref, hard, free)?;
            let bwd_data = registry.workspace_bytes(accel, i, Direction::BackwardData, algo_pref, hard, free)?;
            ws = bwd_filter.max(bwd_data);
            if !pool.alloc(ws) {
                return None;
            }
        }
        if ws > 0 {
            pool.free(ws);
        }

        pool.free(registry.activation_bytes(i + 1));
        pool.free(registry.activation_bytes(i + 1)); // grad[i+1] mirrors activation[i+1]'s size
        if i == 0 {
            pool.free(registry.activation_bytes(0));
        }
    }

    Some(pool.max_consumed)
}

/// `choose_plan`: tries candidate plans in the fixed priority order,
/// filtered to the rows `config.planner_policy` permits, and returns the
/// first that confirms (`spec.md` §4.3).
pub fn choose_plan(config: &NetworkConfig, registry: &LayerRegistry, accel: &dyn Accelerator) -> Result<Plan> {
    let kinds: Vec<LayerKind> = (0..registry.len()).map(|i| registry.kind(i)).collect();
    let param_bytes = registry.param_bytes();
    let budget = config.device_memory_bytes;

    let allowed = |k: OffloadKind| -> bool {
        match config.planner_policy {
            PlannerPolicy::None => matches!(k, OffloadKind::None),
            PlannerPolicy::ConvOnly => matches!(k, OffloadKind::ConvOnly),
            PlannerPolicy::All => matches!(k, OffloadKind::All),
            PlannerPolicy::Dynamic => true,
        }
    };

    for &(offload_kind, algo_sel, hard) in TABLE.iter() {
        if !allowed(offload_kind) {
            continue;
        }

        let offload = match offload_kind {
            OffloadKind::None => vec![false; kinds.len()],
            OffloadKind::ConvOnly => schedule::offload_bitmap(&kinds, true),
            OffloadKind::All => schedule::offload_bitmap(&kinds, false),
        };
        let algo_pref = match algo_sel {
            AlgoSel::Configured => config.algo_preference,
            AlgoSel::Performance => AlgoPreference::PerformanceOptimal,
            AlgoSel::Memory => AlgoPreference::MemoryOptimal,
        };

        debug!("choose_plan: trying offload={offload_kind:?} algo={algo_pref:?} hard={hard}");

        let Some(peak_bytes) = simulate(registry, accel, &offload, algo_pref, hard, param_bytes, Some(budget)) else {
            continue;
        };
        // Allocator confirmation: replay the identical schedule against a
        // pool sized exactly to the analytic peak (`spec.md` §4.3 phase 2).
        if simulate(registry, accel, &offload, algo_pref, hard, param_bytes, Some(peak_bytes)).is_none() {
            continue;
        }

        let plan = Plan { offload, algo_pref, hard, peak_bytes };
        info!("choose_plan: selected {}", plan.describe());
        return Ok(plan);
    }

    Err(Error::planner_infeasible(format!(
        "no candidate plan fits device budget {budget} bytes ({} resident parameter bytes alone)",
        param_bytes
    )))
}

impl std::fmt::Debug for OffloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OffloadKind::None => "none",
            OffloadKind::ConvOnly => "conv-only",
            OffloadKind::All => "all",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::sim::SimAccelerator;
    use crate::config::{LayerSpec, UpdateRule};
    use std::sync::Arc;

    fn small_network() -> (NetworkConfig, Arc<dyn Accelerator>) {
        let accel: Arc<dyn Accelerator> = Arc::new(SimAccelerator::new());
        let config = NetworkConfig {
            layers: vec![
                LayerSpec { kind: LayerKind::Convolution, input_shape: (32, 3, 16, 16), output_shape: (32, 8, 16, 16), fused_activation: None },
                LayerSpec { kind: LayerKind::Activation, input_shape: (32, 8, 16, 16), output_shape: (32, 8, 16, 16), fused_activation: None },
                LayerSpec { kind: LayerKind::Softmax, input_shape: (32, 8, 16, 16), output_shape: (32, 8, 16, 16), fused_activation: None },
            ],
            planner_policy: PlannerPolicy::None,
            update_rule: UpdateRule::Sgd,
            ..NetworkConfig::default()
        };
        (config, accel)
    }

    fn build_registry(config: &NetworkConfig, accel: &Arc<dyn Accelerator>) -> LayerRegistry {
        let suballoc = crate::suballoc::Suballocator::new(Arc::clone(accel), config.device_memory_bytes).unwrap();
        LayerRegistry::build(config, accel.as_ref(), &suballoc).unwrap()
    }

    #[test]
    fn scenario_small_network_fits_without_offload() {
        let (config, accel) = small_network();
        let registry = build_registry(&config, &accel);
        let plan = choose_plan(&config, &registry, accel.as_ref()).unwrap();
        assert!(plan.offload.iter().all(|&o| !o));
        assert!(plan.hard);
        assert_eq!(plan.algo_pref, AlgoPreference::PerformanceOptimal);
    }

    #[test]
    fn scenario_infeasible_when_params_exceed_budget() {
        let (mut config, accel) = small_network();
        config.planner_policy = PlannerPolicy::Dynamic;
        config.device_memory_bytes = 1;
        let registry = build_registry(&config, &accel);
        let err = choose_plan(&config, &registry, accel.as_ref()).unwrap_err();
        assert!(err.is_planner_infeasible());
    }

    #[test]
    fn p5_offloading_a_layer_never_increases_peak_bytes() {
        let (config, accel) = small_network();
        let registry = build_registry(&config, &accel);
        let kinds: Vec<LayerKind> = (0..registry.len()).map(|i| registry.kind(i)).collect();
        let param_bytes = registry.param_bytes();

        let none = vec![false; kinds.len()];
        let mut one_offloaded = none.clone();
        one_offloaded[0] = true;

        let peak_none = simulate(&registry, accel.as_ref(), &none, AlgoPreference::PerformanceOptimal, true, param_bytes, None).unwrap();
        let peak_offload = simulate(&registry, accel.as_ref(), &one_offloaded, AlgoPreference::PerformanceOptimal, true, param_bytes, None).unwrap();
        assert!(peak_offload <= peak_none);
    }

    #[test]
    fn conv_only_policy_marks_only_non_terminal_convolutions() {
        let accel: Arc<dyn Accelerator> = Arc::new(SimAccelerator::new());
        let config = NetworkConfig {
            layers: vec![
                LayerSpec { kind: LayerKind::Convolution, input_shape: (256, 3, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Activation, input_shape: (256, 8, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Convolution, input_shape: (256, 8, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Activation, input_shape: (256, 8, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Convolution, input_shape: (256, 8, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Activation, input_shape: (256, 8, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Softmax, input_shape: (256, 8, 8, 8), output_shape: (256, 8, 8, 8), fused_activation: None },
            ],
            planner_policy: PlannerPolicy::ConvOnly,
            device_memory_bytes: 64 * 1024 * 1024,
            ..NetworkConfig::default()
        };
        let registry = build_registry(&config, &accel);
        let plan = choose_plan(&config, &registry, accel.as_ref()).unwrap();
        // Three convolutions sit at indices 0, 2, 4. Index 0 is layer zero
        // (never offloaded: the forward schedule never offloads the
        // network's own input). Index 4 is the last eligible layer, exempt.
        // Only index 2 — a genuinely non-terminal, non-zero convolution —
        // is offloaded.
        assert!(!plan.is_offloaded(0));
        assert!(plan.is_offloaded(2));
        assert!(!plan.is_offloaded(4));
        assert!(!plan.is_offloaded(1));
        assert!(!plan.is_offloaded(3));
        assert!(!plan.is_offloaded(5));
        assert!(!plan.is_offloaded(6));
    }
}
