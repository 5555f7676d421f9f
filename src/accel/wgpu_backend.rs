// src/accel/wgpu_backend.rs
//! A real `wgpu::Device`/`Queue`-backed [`super::Accelerator`].
//!
//! Bring-up is grounded on `src/lib.rs`'s `Instance` → `request_adapter` →
//! `request_device` sequence, minus the surface/window (a training run has
//! no swapchain). The device arena is one big `wgpu::Buffer`; host copies
//! go through a short-lived staging buffer the way `gpu::resource_pool`'s
//! staging ring does. Per `spec.md` §1, the actual per-layer numeric
//! kernels stay out of scope — `forward`/`backward` here only move the
//! bytes the contract promises; a real deployment would replace the
//! marker dispatch with compiled WGSL compute pipelines selected per
//! [`super::ConvAlgo`].

use std::collections::HashMap;
use std::sync::Mutex;

use super::{Accelerator, BackwardArgs, ConvAlgo, DeviceHandle, Direction, ForwardArgs, TensorDesc};
use crate::config::AlgoPreference;
use crate::error::{Error, Result};
use crate::registry::LayerKind;

struct LayerMeta {
    kind: LayerKind,
    output: TensorDesc,
}

pub struct WgpuAccelerator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    arena: Mutex<Option<wgpu::Buffer>>,
    layers: Mutex<HashMap<usize, LayerMeta>>,
}

impl WgpuAccelerator {
    /// Headless device bring-up: no surface, no window, `HighPerformance`
    /// power preference, default limits.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::custom("no compatible wgpu adapter"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("vdnn_runtime_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::custom(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            arena: Mutex::new(None),
            layers: Mutex::new(HashMap::new()),
        })
    }

    /// Blocking bring-up for callers outside an async runtime (the crate
    /// has none of its own), matching the teacher's `pollster::block_on`
    /// wrapper around its own device bring-up in `lib.rs::run_native`.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    fn arena_buffer(&self) -> Result<std::sync::MutexGuard<'_, Option<wgpu::Buffer>>> {
        let guard = self.arena.lock().unwrap();
        if guard.is_none() {
            return Err(Error::invariant("wgpu accelerator pool not reserved"));
        }
        Ok(guard)
    }
}

impl Accelerator for WgpuAccelerator {
    fn reserve_pool(&self, capacity_bytes: u64) -> Result<()> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vdnn_device_arena"),
            size: capacity_bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        *self.arena.lock().unwrap() = Some(buffer);
        Ok(())
    }

    fn release_pool(&self) {
        *self.arena.lock().unwrap() = None;
    }

    fn describe_layer(&self, layer: usize, kind: LayerKind, _input: TensorDesc, output: TensorDesc) {
        self.layers.lock().unwrap().insert(layer, LayerMeta { kind, output });
    }

    fn copy_to_host(&self, handle: DeviceHandle, host: &mut [u8]) -> Result<()> {
        let guard = self.arena_buffer()?;
        let arena = guard.as_ref().unwrap();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vdnn_readback_staging"),
            size: handle.bytes,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("vdnn_copy_to_host") });
        encoder.copy_buffer_to_buffer(arena, handle.offset, &staging, 0, handle.bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| Error::custom(e.to_string()))?
            .map_err(|e| Error::custom(format!("buffer map failed: {e:?}")))?;

        host[..handle.bytes as usize].copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn copy_from_host(&self, host: &[u8], handle: DeviceHandle) -> Result<()> {
        let guard = self.arena_buffer()?;
        let arena = guard.as_ref().unwrap();
        self.queue.write_buffer(arena, handle.offset, &host[..handle.bytes as usize]);
        Ok(())
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<()> {
        // Extension point: dispatch the real compute pipeline for
        // `args.kind` here, bound to `args.input`/`args.output`/
        // `args.workspace` byte ranges within the arena buffer. Until
        // then we submit a zero-size marker pass so stream ordering
        // stays observable even on a real device.
        let guard = self.arena_buffer()?;
        let _ = guard;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("vdnn_forward_marker") });
        self.queue.submit(Some(encoder.finish()));
        let _ = args;
        Ok(())
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        let guard = self.arena_buffer()?;
        let _ = guard;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("vdnn_backward_marker") });
        self.queue.submit(Some(encoder.finish()));
        let _ = args.learning_rate;
        Ok(())
    }

    fn conv_algo_candidates(&self, layer: usize, direction: Direction) -> Vec<ConvAlgo> {
        let layers = self.layers.lock().unwrap();
        match layers.get(&layer) {
            Some(meta) if meta.kind == LayerKind::Convolution => {
                let base = meta.output.bytes().max(1);
                let dir_mul = match direction {
                    Direction::Forward => 1,
                    Direction::BackwardFilter => 2,
                    Direction::BackwardData => 3,
                };
                (0..3)
                    .map(|id| ConvAlgo { id, workspace_bytes: (base * dir_mul) / (1 << id) })
                    .collect()
            }
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
            AlgoPreference::PerformanceOptimal => candidates.sort_by_key(|a| a.id),
            AlgoPreference::MemoryOptimal => candidates.sort_by_key(|a| a.workspace_bytes),
        }
        if hard {
            candidates.into_iter().find(|a| a.workspace_bytes <= free_bytes).map(|a| a.workspace_bytes)
        } else {
            let budget = free_bytes / 2;
            candidates
                .iter()
                .find(|a| a.workspace_bytes <= budget)
                .map(|a| a.workspace_bytes)
                .or_else(|| candidates.iter().map(|a| a.workspace_bytes).min())
        }
    }
}

