//! The model seam: everything the engine needs from a network.
//!
//! Parameters carry an explicit [`ParamRole`] set at construction time, and
//! `forward` returns the captured layer inputs instead of stashing them on
//! the model, so a second forward pass can never clobber activations a
//! caller still holds.

use std::collections::BTreeMap;

use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Task identifier `0..N`.
pub type TaskId = usize;

/// Capability tag attached to every parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamRole {
    /// Weight of projectable layer `layer`. `rank` is the rank of the
    /// underlying tensor (2 for dense, 4 for convolution); the stored value
    /// is always flattened to `(out, fan_in)`.
    Projectable { layer: usize, rank: u8 },

    /// 1-D parameter (bias, norm scale) owned by projectable layer `layer`.
    /// Its gradient is zeroed on every task after the first.
    LayerVector { layer: usize },

    /// Task heads and anything else outside the protected set.
    Free,
}

/// A named, tagged parameter. 1-D parameters are stored as `(1, n)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub role: ParamRole,
    pub value: Array2<f32>,
}

impl Parameter {
    pub fn new(name: &str, role: ParamRole, value: Array2<f32>) -> Self {
        Self {
            name: name.to_string(),
            role,
            value,
        }
    }

    /// Projectable layer index, if this is a projectable weight.
    pub fn projectable_layer(&self) -> Option<usize> {
        match self.role {
            ParamRole::Projectable { layer, .. } => Some(layer),
            _ => None,
        }
    }

    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

/// How a projectable layer consumes its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerGeometry {
    /// Fully connected: representation = input batch transposed.
    Dense { in_features: usize },

    /// Convolution (or 1×1 shortcut): representation = receptive-field patches.
    Conv {
        in_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    },
}

impl LayerGeometry {
    /// Row count of the representation matrix (= fan-in of the weight).
    pub fn feature_dim(&self) -> usize {
        match *self {
            LayerGeometry::Dense { in_features } => in_features,
            LayerGeometry::Conv {
                in_channels,
                kernel,
                ..
            } => in_channels * kernel * kernel,
        }
    }
}

/// Input activation captured for one projectable layer.
#[derive(Clone, Debug)]
pub enum Activation {
    /// `(batch, features)`.
    Dense(Array2<f32>),
    /// `(batch, channels, height, width)`.
    Spatial(Array4<f32>),
}

impl Activation {
    pub fn batch_size(&self) -> usize {
        match self {
            Activation::Dense(a) => a.nrows(),
            Activation::Spatial(a) => a.dim().0,
        }
    }
}

/// Result of one forward pass.
#[derive(Clone, Debug)]
pub struct ForwardPass {
    /// Logits of the requested task, `(batch, classes)`.
    pub output: Array2<f32>,

    /// Input of every projectable layer, keyed by layer index.
    pub captures: BTreeMap<usize, Activation>,

    /// Model-private intermediates needed by `backward`.
    pub tape: Vec<Array2<f32>>,

    /// Task whose head produced `output`.
    pub task: TaskId,
}

/// A trainable network as seen by the engine.
pub trait Model {
    /// Parameters in a stable order.
    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Geometry of each projectable layer, indexed by layer.
    fn layer_geometry(&self) -> Vec<LayerGeometry>;

    /// Forward pass through the shared trunk and the head of `task`.
    ///
    /// Fails on a wrong input width or a task without a head.
    fn forward(&self, input: &Array2<f32>, task: TaskId) -> Result<ForwardPass>;

    /// Gradients of the loss w.r.t. every parameter, in `parameters()` order,
    /// given the gradient w.r.t. `pass.output`.
    fn backward(&self, pass: &ForwardPass, grad_output: &Array2<f32>) -> Vec<Array2<f32>>;

    /// Number of projectable layers.
    fn projectable_layers(&self) -> usize {
        self.layer_geometry().len()
    }

    /// Index into `parameters()` of the weight of projectable layer `layer`.
    fn weight_index(&self, layer: usize) -> Option<usize> {
        self.parameters()
            .iter()
            .position(|p| p.projectable_layer() == Some(layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_dim() {
        assert_eq!(LayerGeometry::Dense { in_features: 7 }.feature_dim(), 7);
        let conv = LayerGeometry::Conv {
            in_channels: 3,
            kernel: 5,
            stride: 1,
            padding: 2,
        };
        assert_eq!(conv.feature_dim(), 75);
    }

    #[test]
    fn test_projectable_layer_tag() {
        let w = Parameter::new(
            "lin1.weight",
            ParamRole::Projectable { layer: 2, rank: 2 },
            Array2::zeros((4, 3)),
        );
        let b = Parameter::new(
            "lin1.bias",
            ParamRole::LayerVector { layer: 2 },
            Array2::zeros((1, 4)),
        );
        assert_eq!(w.projectable_layer(), Some(2));
        assert_eq!(b.projectable_layer(), None);
        assert_eq!(w.numel(), 12);
    }
}
