// src/lib.rs
//! A virtualized-device-memory (vDNN) training runtime core: offloads
//! per-layer forward activations to pinned host memory during the
//! forward pass and prefetches them ahead of backward, so a network
//! whose activations (not just its parameters) exceed accelerator memory
//! can still train.
//!
//! [`TrainingRuntime`] is the crate's single entry point: build one from
//! a [`NetworkConfig`] and an [`Accelerator`], then call [`TrainingRuntime::step`]
//! per mini-batch. Everything it drives — the suballocator
//! ([`suballoc`]), the layer registry ([`registry`]), the memory planner
//! ([`planner`]), and the executor ([`executor`]) — is exposed as its
//! own module for direct use and testing.
#![allow(clippy::too_many_arguments)]

pub mod accel;
pub mod config;
pub mod error;
pub mod executor;
pub mod planner;
pub mod registry;
pub mod schedule;
pub mod suballoc;

use std::sync::Arc;

use log::info;

pub use accel::{Accelerator, DeviceHandle};
pub use config::NetworkConfig;
pub use error::{Error, Result};
pub use executor::Executor;
pub use planner::{choose_plan, Plan};
pub use registry::LayerRegistry;
pub use suballoc::Suballocator;

/// What one [`TrainingRuntime::step`] call produces, depending on whether
/// it ran in training or inference mode (`spec.md` §6: "per-step
/// outputs").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Mean cross-entropy loss over the batch (training mode).
    Loss(f32),
    /// Number of correctly classified samples in the batch (inference mode).
    CorrectCount(usize),
}

/// Owns the registry, the confirmed plan, and the executor that drives
/// them; the crate's single constructor-to-`step` surface.
pub struct TrainingRuntime {
    suballoc: Arc<Suballocator>,
    registry: LayerRegistry,
    plan: Plan,
    executor: Executor,
    num_classes: usize,
}

impl TrainingRuntime {
    /// Builds a registry against `accel`, runs `choose_plan`, and wires up
    /// an executor for the confirmed plan. `accel.reserve_pool` is called
    /// exactly once, inside `Suballocator::new`.
    pub fn new(config: &NetworkConfig, accel: Arc<dyn Accelerator>) -> Result<Self> {
        let suballoc = Arc::new(Suballocator::new(Arc::clone(&accel), config.device_memory_bytes)?);
        let registry = LayerRegistry::build(config, accel.as_ref(), suballoc.as_ref())?;
        let plan = choose_plan(config, &registry, accel.as_ref())?;
        info!("TrainingRuntime::new: {}", plan.describe());

        let num_classes = config
            .layers
            .last()
            .map(|l| l.output_shape.1 as usize)
            .ok_or_else(|| Error::invariant("network has no layers".to_string()))?;

        let executor = Executor::new(Arc::clone(&accel), Arc::clone(&suballoc), &registry, &plan);
        Ok(Self { suballoc, registry, plan, executor, num_classes })
    }

    /// The plan `choose_plan` settled on at construction.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Runs one forward pass (and, when `training`, the matching
    /// backward pass and SGD update) over `input`. `input` must hold
    /// exactly `activation_bytes(0)` bytes, laid out as row-major
    /// `f32` per `config.precision`/`config.layout`.
    pub fn step(&mut self, input: &[u8], labels: &[u32], learning_rate: f32, training: bool) -> Result<StepOutcome> {
        let output = self.executor.forward(&mut self.registry, &self.plan, input, training)?;

        if !training {
            let correct = self.count_correct(output, labels)?;
            self.suballoc.free(output)?;
            let last = self.registry.activation.len() - 1;
            self.registry.activation[last] = None;
            return Ok(StepOutcome::CorrectCount(correct));
        }

        let (loss, grad_final) = self.softmax_cross_entropy_grad(output, labels)?;
        self.executor.backward(&mut self.registry, &self.plan, grad_final, learning_rate)?;
        Ok(StepOutcome::Loss(loss))
    }

    /// Reads the network's final activation as per-sample logits over
    /// `num_classes`, and builds the softmax-cross-entropy gradient
    /// buffer that seeds `grad[L]`. The numeric primitives run inside the
    /// opaque `Accelerator` boundary, so this is ordinary host
    /// arithmetic over the bytes it hands back, not a device kernel.
    fn softmax_cross_entropy_grad(&self, output: DeviceHandle, labels: &[u32]) -> Result<(f32, DeviceHandle)> {
        let bytes = output.bytes() as usize;
        let mut host = vec![0u8; bytes];
        self.suballoc.copy_to_host(output, &mut host)?;

        let stride = self.num_classes * 4;
        let batch = labels.len();
        let mut grad_host = vec![0u8; bytes];
        let mut total_loss = 0.0f32;

        for n in 0..batch {
            let row = &host[n * stride..(n + 1) * stride];
            let probs = softmax_row(row, self.num_classes);
            let label = labels[n] as usize;
            total_loss += -(probs[label].max(1e-12)).ln();

            let grad_row = &mut grad_host[n * stride..(n + 1) * stride];
            for c in 0..self.num_classes {
                let g = probs[c] - if c == label { 1.0 } else { 0.0 };
                grad_row[c * 4..c * 4 + 4].copy_from_slice(&g.to_le_bytes());
            }
        }

        let grad_handle = self.suballoc.alloc(output.bytes())?;
        self.suballoc.copy_from_host(&grad_host, grad_handle)?;
        Ok((total_loss / batch.max(1) as f32, grad_handle))
    }

    fn count_correct(&self, output: DeviceHandle, labels: &[u32]) -> Result<usize> {
        let bytes = output.bytes() as usize;
        let mut host = vec![0u8; bytes];
        self.suballoc.copy_to_host(output, &mut host)?;

        let stride = self.num_classes * 4;
        let mut correct = 0;
        for (n, &label) in labels.iter().enumerate() {
            let row = &host[n * stride..(n + 1) * stride];
            let argmax = (0..self.num_classes)
                .max_by(|&a, &b| {
                    let va = f32::from_le_bytes(row[a * 4..a * 4 + 4].try_into().unwrap());
                    let vb = f32::from_le_bytes(row[b * 4..b * 4 + 4].try_into().unwrap());
                    va.total_cmp(&vb)
                })
                .unwrap_or(0);
            if argmax as u32 == label {
                correct += 1;
            }
        }
        Ok(correct)
    }

    /// Frees every layer's parameter tensors and joins the executor's
    /// worker threads. Consumes the runtime — there is no use for it
    /// afterwards.
    pub fn shutdown(mut self) -> Result<()> {
        self.registry.teardown(self.suballoc.as_ref())?;
        self.executor.shutdown();
        Ok(())
    }
}

fn softmax_row(row: &[u8], num_classes: usize) -> Vec<f32> {
    let mut logits = vec![0.0f32; num_classes];
    for (c, slot) in logits.iter_mut().enumerate() {
        *slot = f32::from_le_bytes(row[c * 4..c * 4 + 4].try_into().unwrap());
    }
    let max = logits.iter().cloned().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum::<f32>().max(1e-12);
    exps.into_iter().map(|e| e / sum).collect()
}
