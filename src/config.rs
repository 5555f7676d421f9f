// src/config.rs
//! Constructor-time configuration for a [`crate::TrainingRuntime`].
//!
//! Mirrors the teacher's struct-of-defaults config style
//! (`OffloadConfig`/`PoolConfig`): a plain `serde`-derived struct with a
//! sensible `Default`, optionally loaded from a TOML file.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::LayerKind;

/// Numeric precision shared by every tensor in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Float32,
    Float64,
}

impl Precision {
    #[inline]
    pub fn bytes_per_elem(self) -> u64 {
        match self {
            Precision::Float32 => 4,
            Precision::Float64 => 8,
        }
    }
}

/// Tensor memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    Nchw,
    Nhwc,
}

/// Which layers get their forward activation offloaded to pinned host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannerPolicy {
    /// No offload; network must fit in the device budget performance-optimally.
    None,
    /// Only Convolution layers are offloaded.
    ConvOnly,
    /// Every eligible (non-Activation/Softmax, non-terminal) layer is offloaded.
    All,
    /// Walk `choose_plan`'s full priority table and use the first plan that confirms.
    Dynamic,
}

/// Convolution algorithm preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgoPreference {
    PerformanceOptimal,
    MemoryOptimal,
}

/// Parameter-update rule. Only SGD is implemented; the enum exists so the
/// boundary is explicit rather than implied by a single free function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRule {
    Sgd,
}

/// (N, C, H, W) shape tuple.
pub type Shape = (u32, u32, u32, u32);

/// A single layer's static specification, as provided by the caller at
/// construction time. The [`crate::registry::LayerRegistry`] turns these into
/// fully resolved [`crate::registry::LayerDescriptor`]s (with algorithm
/// choices and workspace sizes) once it has an `Accelerator` to query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub input_shape: Shape,
    pub output_shape: Shape,
    /// Fused activation id applied after Conv/FC output; `None` otherwise.
    pub fused_activation: Option<String>,
}

/// Constructor inputs for a [`crate::TrainingRuntime`] (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub layers: Vec<LayerSpec>,
    pub precision: Precision,
    pub layout: Layout,
    pub batch_size: u32,
    pub dropout_seed: u64,
    pub softmax_epsilon: f32,
    pub weight_init_std: f32,
    pub planner_policy: PlannerPolicy,
    pub algo_preference: AlgoPreference,
    pub update_rule: UpdateRule,
    /// The physical device's total addressable memory. Not part of
    /// `spec.md`'s constructor-input list verbatim, but implied by its
    /// premise (vDNN exists to fit networks "larger than accelerator
    /// memory"): the planner has nothing to measure feasibility against
    /// without it, so `choose_plan` takes it as the `Suballocator`
    /// capacity ceiling every candidate plan's simulation must respect.
    pub device_memory_bytes: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            precision: Precision::Float32,
            layout: Layout::Nchw,
            batch_size: 32,
            dropout_seed: 0xC0FFEE,
            softmax_epsilon: 1e-8,
            weight_init_std: 0.01,
            planner_policy: PlannerPolicy::Dynamic,
            algo_preference: AlgoPreference::PerformanceOptimal,
            update_rule: UpdateRule::Sgd,
            device_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::error::Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = NetworkConfig::default();
        let s = cfg.to_toml_string().unwrap();
        let back = NetworkConfig::from_toml_str(&s).unwrap();
        assert_eq!(back.batch_size, cfg.batch_size);
        assert_eq!(back.dropout_seed, cfg.dropout_seed);
    }
}
