// src/accel/mod.rs
//! The opaque DNN-primitive / device-stream boundary.
//!
//! `spec.md` treats per-layer numeric kernels and the underlying DNN
//! primitive library as out of scope; this module is the seam the rest
//! of the crate calls through so that seam is still something you can
//! compile and test against. [`SimAccelerator`] (`sim.rs`) implements it
//! with host-side bookkeeping only. [`WgpuAccelerator`] (`wgpu_backend.rs`)
//! sketches a real `wgpu::Device`/`Queue` binding.

pub mod sim;
pub mod wgpu_backend;

use crate::config::{AlgoPreference, Precision};
use crate::error::Result;
use crate::registry::LayerKind;

/// Non-owning, generation-tagged handle into an [`Accelerator`]'s device
/// arena. Ownership of the bytes it points at lives in the
/// [`crate::suballoc::Suballocator`]; this is the concrete type behind
/// `spec.md`'s `activation[i]`/`grad[i]` raw-pointer tables (see Design
/// Note "raw pointer tables as ownership").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub(crate) offset: u64,
    pub(crate) bytes: u64,
    pub(crate) generation: u32,
}

impl DeviceHandle {
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Which convolution pass a workspace/algorithm query is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    BackwardFilter,
    BackwardData,
}

/// A candidate convolution algorithm and the workspace it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvAlgo {
    pub id: u32,
    pub workspace_bytes: u64,
}

/// Tensor shape + precision, as seen by the accelerator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: (u32, u32, u32, u32),
    pub precision: Precision,
}

impl TensorDesc {
    #[inline]
    pub fn elems(&self) -> u64 {
        let (n, c, h, w) = self.shape;
        n as u64 * c as u64 * h as u64 * w as u64
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.elems() * self.precision.bytes_per_elem()
    }
}

/// Arguments for a forward primitive call (`spec.md` §4.2).
pub struct ForwardArgs<'a> {
    pub layer: usize,
    pub kind: LayerKind,
    pub input: DeviceHandle,
    pub output: DeviceHandle,
    pub workspace: Option<DeviceHandle>,
    pub params: &'a [DeviceHandle],
}

/// Arguments for a backward primitive call (`spec.md` §4.2).
pub struct BackwardArgs<'a> {
    pub layer: usize,
    pub kind: LayerKind,
    pub fwd_input: DeviceHandle,
    pub fwd_output: DeviceHandle,
    pub grad_input: DeviceHandle,
    pub grad_output: Option<DeviceHandle>,
    pub workspace: Option<DeviceHandle>,
    pub params: &'a [DeviceHandle],
    pub learning_rate: f32,
}

/// The opaque DNN-primitive + device-pool boundary. Implemented by
/// [`sim::SimAccelerator`] for tests/the demo binary and sketched by
/// [`wgpu_backend::WgpuAccelerator`] for a real device target.
pub trait Accelerator: Send + Sync {
    /// Reserve a fixed-size contiguous device arena. Called exactly once,
    /// by `Suballocator::init`; nothing below this trait is called again
    /// to grow or shrink the pool afterwards.
    fn reserve_pool(&self, capacity_bytes: u64) -> Result<()>;

    /// Release the reserved pool (teardown).
    fn release_pool(&self);

    /// Register a layer's shape metadata so later `workspace_bytes` /
    /// `conv_algo_candidates` / `forward` / `backward` calls addressed by
    /// `layer` index have something to query against. Called once per
    /// layer while the `LayerRegistry` is being built.
    fn describe_layer(&self, layer: usize, kind: LayerKind, input: TensorDesc, output: TensorDesc);

    /// Copy `handle`'s bytes from the device arena into a host buffer.
    fn copy_to_host(&self, handle: DeviceHandle, host: &mut [u8]) -> Result<()>;

    /// Copy a host buffer into the device arena at `handle`.
    fn copy_from_host(&self, host: &[u8], handle: DeviceHandle) -> Result<()>;

    /// Run layer `args.layer`'s forward primitive.
    fn forward(&self, args: ForwardArgs<'_>) -> Result<()>;

    /// Run layer `args.layer`'s backward primitive (weight-gradient,
    /// data-gradient, and the SGD parameter step, per `spec.md` §4.4).
    fn backward(&self, args: BackwardArgs<'_>) -> Result<()>;

    /// Candidate convolution algorithms for `kind` (only meaningful for
    /// `LayerKind::Convolution`), widest-workspace first.
    fn conv_algo_candidates(&self, layer: usize, direction: Direction) -> Vec<ConvAlgo>;

    /// `spec.md` §4.2 algorithm-selection policy: pick a workspace size for
    /// `layer`/`direction` given `algo_pref`, `hard` discipline, and the
    /// number of bytes currently free in the pool. Returns `None`
    /// (`-1` in `spec.md`) when infeasible.
    fn workspace_bytes(
        &self,
        layer: usize,
        direction: Direction,
        algo_pref: AlgoPreference,
        hard: bool,
        free_bytes: u64,
    ) -> Option<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_desc_byte_math() {
        let t = TensorDesc {
            shape: (8, 3, 32, 32),
            precision: Precision::Float32,
        };
        assert_eq!(t.elems(), 8 * 3 * 32 * 32);
        assert_eq!(t.bytes(), t.elems() * 4);
    }
}
