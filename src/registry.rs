// src/registry.rs
//! The layer registry (`spec.md` §4.2): static layer metadata, parameter
//! tensors, and the per-layer forward/backward/workspace entry points the
//! planner and executor drive.

use serde::{Deserialize, Serialize};

use crate::accel::{Accelerator, BackwardArgs, ConvAlgo, DeviceHandle, Direction, ForwardArgs, TensorDesc};
use crate::config::{AlgoPreference, Layout, NetworkConfig, Precision, Shape};
use crate::error::{Error, Result};
use crate::suballoc::Suballocator;

/// `spec.md` §3: the tagged layer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Convolution,
    FullyConnected,
    Dropout,
    BatchNorm,
    Pooling,
    Activation,
    Softmax,
}

impl LayerKind {
    /// Activation and Softmax are compute-fused trailing steps: never
    /// offloaded, and the layer after them aliases its backward gradient.
    #[inline]
    pub fn is_alias_kind(self) -> bool {
        matches!(self, LayerKind::Activation | LayerKind::Softmax)
    }
}

/// Per-layer convolution algorithm choice + workspace size, locked in at
/// plan time so the planner and executor can never disagree under memory
/// pressure (Design Note, `spec.md` §9).
#[derive(Debug, Clone, Copy)]
pub struct ConvPlan {
    pub forward: ConvAlgo,
    pub backward_filter: ConvAlgo,
    pub backward_data: ConvAlgo,
}

impl ConvPlan {
    /// `spec.md` §9: backward workspace is `max(bwd_filter_ws, bwd_data_ws)`.
    #[inline]
    pub fn backward_workspace_bytes(&self) -> u64 {
        self.backward_filter.workspace_bytes.max(self.backward_data.workspace_bytes)
    }
}

/// Static per-layer metadata plus its (non-owning) parameter tensor
/// handles (`spec.md` §3).
pub struct LayerDescriptor {
    pub kind: LayerKind,
    pub input_shape: Shape,
    pub output_shape: Shape,
    pub fused_activation: Option<String>,
    pub params: Vec<DeviceHandle>,
    pub conv_plan: Option<ConvPlan>,
    pub dropout_reserve_bytes: Option<u64>,
    pub batchnorm_alloc_bytes: Option<u64>,
}

impl LayerDescriptor {
    fn tensor_desc(shape: Shape, precision: Precision) -> TensorDesc {
        TensorDesc { shape, precision }
    }
}

/// Ordered sequence of [`LayerDescriptor`]s, index 0..L-1, with shared
/// precision/layout. Owns no device memory itself — `activation`/`grad`
/// are non-owning [`DeviceHandle`] tables whose lifetime is bounded by
/// explicit alloc/free calls against `suballoc` (`spec.md` §3).
pub struct LayerRegistry {
    pub layers: Vec<LayerDescriptor>,
    pub precision: Precision,
    pub layout: Layout,
    /// `activation[i]` is the input to layer `i`; `activation[L]` is the
    /// network output. Length `L + 1`.
    pub activation: Vec<Option<DeviceHandle>>,
    /// `grad[i]` is the upstream gradient feeding layer `i`'s backward.
    /// Length `L + 1`.
    pub grad: Vec<Option<DeviceHandle>>,
}

impl LayerRegistry {
    /// Builds the registry from a [`NetworkConfig`], allocating parameter
    /// tensors against `suballoc` (freed at `teardown`) and resolving
    /// convolution algorithms against `accel` per `config.algo_preference`
    /// in `hard` mode against the pool's *total* capacity (parameters are
    /// the only allocation alive at construction time).
    pub fn build(
        config: &NetworkConfig,
        accel: &dyn Accelerator,
        suballoc: &Suballocator,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.layers.len());

        for (i, spec) in config.layers.iter().enumerate() {
            let input = LayerDescriptor::tensor_desc(spec.input_shape, config.precision);
            let output = LayerDescriptor::tensor_desc(spec.output_shape, config.precision);
            accel.describe_layer(i, spec.kind, input, output);

            let conv_plan = if spec.kind == LayerKind::Convolution {
                Some(Self::pick_conv_plan(accel, i, config.algo_preference)?)
            } else {
                None
            };

            let params = Self::alloc_params(spec.kind, output, suballoc)?;

            let dropout_reserve_bytes = if spec.kind == LayerKind::Dropout {
                Some(output.bytes())
            } else {
                None
            };
            let batchnorm_alloc_bytes = if spec.kind == LayerKind::BatchNorm {
                Some(2 * output.shape.1 as u64 * config.precision.bytes_per_elem())
            } else {
                None
            };

            layers.push(LayerDescriptor {
                kind: spec.kind,
                input_shape: spec.input_shape,
                output_shape: spec.output_shape,
                fused_activation: spec.fused_activation.clone(),
                params,
                conv_plan,
                dropout_reserve_bytes,
                batchnorm_alloc_bytes,
            });
        }

        let len = layers.len();
        Ok(Self {
            layers,
            precision: config.precision,
            layout: config.layout,
            activation: vec![None; len + 1],
            grad: vec![None; len + 1],
        })
    }

    fn pick_conv_plan(accel: &dyn Accelerator, layer: usize, algo_pref: AlgoPreference) -> Result<ConvPlan> {
        let pick = |dir: Direction| -> Result<ConvAlgo> {
            let mut candidates = accel.conv_algo_candidates(layer, dir);
            match algo_pref {
                AlgoPreference::PerformanceOptimal => candidates.sort_by_key(|a| a.id),
                AlgoPreference::MemoryOptimal => candidates.sort_by_key(|a| a.workspace_bytes),
            }
            candidates
                .into_iter()
                .next()
                .ok_or_else(|| Error::invariant(format!("layer {layer}: no convolution algorithms available")))
        };
        Ok(ConvPlan {
            forward: pick(Direction::Forward)?,
            backward_filter: pick(Direction::BackwardFilter)?,
            backward_data: pick(Direction::BackwardData)?,
        })
    }

    /// Parameter tensors are allocated at construction and freed at
    /// teardown (`spec.md` §3 Lifecycles).
    fn alloc_params(kind: LayerKind, output: TensorDesc, suballoc: &Suballocator) -> Result<Vec<DeviceHandle>> {
        let channels = output.shape.1 as u64;
        let bpe = output.precision.bytes_per_elem();
        match kind {
            LayerKind::Convolution | LayerKind::FullyConnected => {
                // weights + bias, sized proportionally to the output channel count.
                let weights = suballoc.alloc(channels * channels.max(1) * bpe)?;
                let bias = suballoc.alloc(channels * bpe)?;
                Ok(vec![weights, bias])
            }
            LayerKind::BatchNorm => {
                let scale = suballoc.alloc(channels * bpe)?;
                let bias = suballoc.alloc(channels * bpe)?;
                let running_mean = suballoc.alloc(channels * bpe)?;
                let running_var = suballoc.alloc(channels * bpe)?;
                Ok(vec![scale, bias, running_mean, running_var])
            }
            LayerKind::Dropout | LayerKind::Pooling | LayerKind::Activation | LayerKind::Softmax => Ok(Vec::new()),
        }
    }

    /// Free every layer's parameter tensors. Called once at teardown.
    pub fn teardown(&mut self, suballoc: &Suballocator) -> Result<()> {
        for layer in &mut self.layers {
            for handle in layer.params.drain(..) {
                suballoc.free(handle)?;
            }
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[inline]
    pub fn kind(&self, i: usize) -> LayerKind {
        self.layers[i].kind
    }

    /// Sum of every layer's resident parameter tensor bytes — allocated at
    /// construction, freed only at [`Self::teardown`], so the planner must
    /// count it as a constant baseline in every candidate's simulation.
    pub fn param_bytes(&self) -> u64 {
        self.layers.iter().flat_map(|l| &l.params).map(|h| h.bytes()).sum()
    }

    #[inline]
    pub fn activation_bytes(&self, i: usize) -> u64 {
        // activation[i] is the *input* to layer i; activation[L] is the
        // network output, which has layer (L-1)'s output shape.
        if i == self.layers.len() {
            TensorDesc { shape: self.layers[i - 1].output_shape, precision: self.precision }.bytes()
        } else {
            TensorDesc { shape: self.layers[i].input_shape, precision: self.precision }.bytes()
        }
    }

    /// `workspace_bytes(i, direction, algo_pref, hard) -> bytes | -1`
    /// (`spec.md` §4.2), `None` standing in for `-1`/infeasible.
    pub fn workspace_bytes(
        &self,
        accel: &dyn Accelerator,
        i: usize,
        direction: Direction,
        algo_pref: AlgoPreference,
        hard: bool,
        free_bytes: u64,
    ) -> Option<u64> {
        if self.layers[i].kind != LayerKind::Convolution {
            return Some(0);
        }
        accel.workspace_bytes(i, direction, algo_pref, hard, free_bytes)
    }

    pub fn forward(
        &self,
        accel: &dyn Accelerator,
        i: usize,
        in_ptr: DeviceHandle,
        out_ptr: DeviceHandle,
        workspace: Option<DeviceHandle>,
    ) -> Result<()> {
        accel.forward(ForwardArgs {
            layer: i,
            kind: self.layers[i].kind,
            input: in_ptr,
            output: out_ptr,
            workspace,
            params: &self.layers[i].params,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &self,
        accel: &dyn Accelerator,
        i: usize,
        fwd_in: DeviceHandle,
        fwd_out: DeviceHandle,
        grad_in: DeviceHandle,
        grad_out: Option<DeviceHandle>,
        workspace: Option<DeviceHandle>,
        learning_rate: f32,
    ) -> Result<()> {
        accel.backward(BackwardArgs {
            layer: i,
            kind: self.layers[i].kind,
            fwd_input: fwd_in,
            fwd_output: fwd_out,
            grad_input: grad_in,
            grad_output: grad_out,
            workspace,
            params: &self.layers[i].params,
            learning_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::sim::SimAccelerator;
    use crate::config::{LayerSpec, PlannerPolicy, UpdateRule};

    fn three_layer_config() -> NetworkConfig {
        NetworkConfig {
            layers: vec![
                LayerSpec { kind: LayerKind::Convolution, input_shape: (32, 3, 8, 8), output_shape: (32, 16, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Activation, input_shape: (32, 16, 8, 8), output_shape: (32, 16, 8, 8), fused_activation: None },
                LayerSpec { kind: LayerKind::Softmax, input_shape: (32, 16, 8, 8), output_shape: (32, 16, 8, 8), fused_activation: None },
            ],
            planner_policy: PlannerPolicy::None,
            update_rule: UpdateRule::Sgd,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn builds_params_and_activation_tables() {
        use std::sync::Arc;
        let accel: Arc<dyn Accelerator> = Arc::new(SimAccelerator::new());
        let suballoc = Suballocator::new(Arc::clone(&accel), 1 << 20).unwrap();
        let config = three_layer_config();

        let registry = LayerRegistry::build(&config, accel.as_ref(), &suballoc).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.activation.len(), 4);
        assert_eq!(registry.grad.len(), 4);
        assert!(registry.layers[0].conv_plan.is_some());
        assert!(registry.layers[1].conv_plan.is_none());
        assert!(!registry.layers[0].params.is_empty());
        assert!(registry.layers[1].params.is_empty());
    }

    #[test]
    fn alias_kind_matches_activation_and_softmax_only() {
        assert!(LayerKind::Activation.is_alias_kind());
        assert!(LayerKind::Softmax.is_alias_kind());
        assert!(!LayerKind::Convolution.is_alias_kind());
        assert!(!LayerKind::BatchNorm.is_alias_kind());
    }
}
