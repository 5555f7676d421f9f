// src/accel/sim.rs
//! Host-side simulation of the [`super::Accelerator`] boundary.
//!
//! No real kernels run here; every primitive only moves bytes around (or
//! does nothing at all) while preserving the size/workspace contract the
//! planner and executor rely on. This is what every test in the crate and
//! the demo binary run against, mirroring the teacher's own mock
//! `GpuTransferQueue` in `offload.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{Accelerator, BackwardArgs, ConvAlgo, Direction, ForwardArgs, TensorDesc};
use crate::config::AlgoPreference;
use crate::error::{Error, Result};
use crate::registry::LayerKind;

struct LayerMeta {
    kind: LayerKind,
    input: TensorDesc,
    output: TensorDesc,
}

/// An in-process stand-in for device memory: one contiguous byte arena
/// guarded by a plain mutex. `Suballocator` is the only caller that
/// touches `capacity`/`arena` outside of `describe_layer`; everything
/// else addresses it by `DeviceHandle` offset.
pub struct SimAccelerator {
    arena: Mutex<Vec<u8>>,
    layers: Mutex<HashMap<usize, LayerMeta>>,
}

impl Default for SimAccelerator {
    fn default() -> Self {
        Self {
            arena: Mutex::new(Vec::new()),
            layers: Mutex::new(HashMap::new()),
        }
    }
}

impl SimAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthetic algorithm table: three candidates per direction, workspace
    /// shrinking as `id` grows, scaled by the layer's output tensor so
    /// different layers get different (but deterministic) numbers.
    fn synth_algos(meta: &LayerMeta, direction: Direction) -> Vec<ConvAlgo> {
        let base = meta.output.bytes().max(1);
        let dir_mul = match direction {
            Direction::Forward => 1,
            Direction::BackwardFilter => 2,
            Direction::BackwardData => 3,
        };
        (0..3)
            .map(|id| ConvAlgo {
                id,
                workspace_bytes: (base * dir_mul) / (1 << id),
            })
            .collect()
    }
}

impl Accelerator for SimAccelerator {
    fn reserve_pool(&self, capacity_bytes: u64) -> Result<()> {
        let mut arena = self.arena.lock().unwrap();
        *arena = vec![0u8; capacity_bytes as usize];
        Ok(())
    }

    fn release_pool(&self) {
        self.arena.lock().unwrap().clear();
    }

    fn describe_layer(&self, layer: usize, kind: LayerKind, input: TensorDesc, output: TensorDesc) {
        self.layers
            .lock()
            .unwrap()
            .insert(layer, LayerMeta { kind, input, output });
    }

    fn copy_to_host(&self, handle: super::DeviceHandle, host: &mut [u8]) -> Result<()> {
        let arena = self.arena.lock().unwrap();
        let start = handle.offset as usize;
        let end = start + handle.bytes as usize;
        if end > arena.len() || host.len() < handle.bytes as usize {
            return Err(Error::invariant("copy_to_host: handle out of bounds"));
        }
        host[..handle.bytes as usize].copy_from_slice(&arena[start..end]);
        Ok(())
    }

    fn copy_from_host(&self, host: &[u8], handle: super::DeviceHandle) -> Result<()> {
        let mut arena = self.arena.lock().unwrap();
        let start = handle.offset as usize;
        let end = start + handle.bytes as usize;
        if end > arena.len() || host.len() < handle.bytes as usize {
            return Err(Error::invariant("copy_from_host: handle out of bounds"));
        }
        arena[start..end].copy_from_slice(&host[..handle.bytes as usize]);
        Ok(())
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<()> {
        // No real kernel: touch the output range so use-after-free shows up
        // under a sanitizer/miri-style run, and leave the rest at zero.
        let mut arena = self.arena.lock().unwrap();
        let start = args.output.offset as usize;
        let end = start + args.output.bytes as usize;
        if end > arena.len() {
            return Err(Error::fatal_primitive(args.layer, "forward", "output handle out of bounds"));
        }
        for b in &mut arena[start..end] {
            *b = b.wrapping_add(1);
        }
        Ok(())
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        let mut arena = self.arena.lock().unwrap();
        let start = args.grad_input.offset as usize;
        let end = start + args.grad_input.bytes as usize;
        if end > arena.len() {
            return Err(Error::fatal_primitive(args.layer, "backward", "grad_input handle out of bounds"));
        }
        for b in &mut arena[start..end] {
            *b = b.wrapping_add(1);
        }
        // Parameter step (SGD: W -= lr * dW) is a no-op here; there is no
        // real gradient, only the byte-range contract above.
        let _ = args.learning_rate;
        Ok(())
    }

    fn conv_algo_candidates(&self, layer: usize, direction: Direction) -> Vec<ConvAlgo> {
        let layers = self.layers.lock().unwrap();
        match layers.get(&layer) {
            Some(meta) if meta.kind == LayerKind::Convolution => Self::synth_algos(meta, direction),
            _ => Vec::new(),
        }
    }

    fn workspace_bytes(
        &self,
        layer: usize,
        direction: Direction,
        algo_pref: AlgoPreference,
        hard: bool,
        free_bytes: u64,
    ) -> Option<u64> {
        let mut candidates = self.conv_algo_candidates(layer, direction);
        if candidates.is_empty() {
            return Some(0);
        }
        match algo_pref {
            AlgoPreference::PerformanceOptimal => {
                // "Fastest" == lowest `id` in our synthetic table.
                candidates.sort_by_key(|a| a.id);
            }
            AlgoPreference::MemoryOptimal => {
                candidates.sort_by_key(|a| a.workspace_bytes);
            }
        }
        if hard {
            candidates
                .into_iter()
                .find(|a| a.workspace_bytes <= free_bytes)
                .map(|a| a.workspace_bytes)
        } else {
            // Soft: fastest among those under a greedy budget (half of free).
            let budget = free_bytes / 2;
            candidates
                .iter()
                .find(|a| a.workspace_bytes <= budget)
                .map(|a| a.workspace_bytes)
                .or_else(|| candidates.iter().map(|a| a.workspace_bytes).min())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{DeviceHandle, TensorDesc};
    use crate::config::Precision;

    fn desc(n: u32, c: u32, h: u32, w: u32) -> TensorDesc {
        TensorDesc { shape: (n, c, h, w), precision: Precision::Float32 }
    }

    #[test]
    fn hard_performance_optimal_picks_fastest_that_fits() {
        let accel = SimAccelerator::new();
        accel.reserve_pool(1 << 20).unwrap();
        accel.describe_layer(0, LayerKind::Convolution, desc(8, 3, 16, 16), desc(8, 16, 16, 16));
        let free = 1024; // small budget; fastest (id 0) likely too big
        let picked = accel.workspace_bytes(0, Direction::Forward, AlgoPreference::PerformanceOptimal, true, free);
        if let Some(bytes) = picked {
            assert!(bytes <= free);
        }
    }

    #[test]
    fn infeasible_hard_query_returns_none() {
        let accel = SimAccelerator::new();
        accel.reserve_pool(1 << 20).unwrap();
        accel.describe_layer(0, LayerKind::Convolution, desc(8, 3, 64, 64), desc(8, 64, 64, 64));
        let picked = accel.workspace_bytes(0, Direction::Forward, AlgoPreference::MemoryOptimal, true, 1);
        assert_eq!(picked, None);
    }

    #[test]
    fn copy_round_trip() {
        let accel = SimAccelerator::new();
        accel.reserve_pool(256).unwrap();
        let handle = DeviceHandle { offset: 16, bytes: 8, generation: 0 };
        accel.copy_from_host(&[1, 2, 3, 4, 5, 6, 7, 8], handle).unwrap();
        let mut out = [0u8; 8];
        accel.copy_to_host(handle, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
