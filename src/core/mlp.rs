//! Reference multi-layer perceptron implementing [`Model`].
//!
//! Trunk: `Linear → ReLU` repeated for each hidden width. Every trunk linear
//! is a projectable layer. The classifier is either one shared head (also
//! projectable, last layer index) or one head per task (free parameters).
//!
//! Backward is written out by hand: for `z = x·Wᵗ + b`,
//! `dW = gᵗ·x`, `db = Σ_rows g`, `dx = g·W`, and ReLU masks `dx` where the
//! layer output was not positive.

use std::collections::BTreeMap;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::model::{
    Activation, ForwardPass, LayerGeometry, Model, ParamRole, Parameter, TaskId,
};
use crate::error::{GpmError, Result};

/// Classifier layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadLayout {
    /// One head with `n_classes` outputs shared by every task (projectable).
    Shared(usize),

    /// One head per task with the given class counts (not projectable).
    PerTask(Vec<usize>),
}

/// Parameter indices of one linear layer.
#[derive(Clone, Copy, Debug)]
struct LinearSlot {
    weight: usize,
    bias: Option<usize>,
}

/// Fully connected ReLU network.
#[derive(Clone, Debug)]
pub struct Mlp {
    params: Vec<Parameter>,
    trunk: Vec<LinearSlot>,
    heads: Vec<LinearSlot>,
    shared_head: bool,
    input_dim: usize,
}

impl Mlp {
    /// Build a network with Kaiming-uniform weights and zero biases.
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        heads: HeadLayout,
        with_bias: bool,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Vec::new();
        let mut trunk = Vec::with_capacity(hidden.len());

        let mut fan_in = input_dim;
        for (layer, &width) in hidden.iter().enumerate() {
            let slot = push_linear(
                &mut params,
                &mut rng,
                &format!("fc{}", layer + 1),
                fan_in,
                width,
                with_bias,
                Some(layer),
            );
            trunk.push(slot);
            fan_in = width;
        }

        let (head_slots, shared_head) = match heads {
            HeadLayout::Shared(n_classes) => {
                let slot = push_linear(
                    &mut params,
                    &mut rng,
                    "head",
                    fan_in,
                    n_classes,
                    with_bias,
                    Some(hidden.len()),
                );
                (vec![slot], true)
            }
            HeadLayout::PerTask(classes) => {
                let slots = classes
                    .iter()
                    .enumerate()
                    .map(|(t, &n)| {
                        push_linear(
                            &mut params,
                            &mut rng,
                            &format!("head{}", t),
                            fan_in,
                            n,
                            true,
                            None,
                        )
                    })
                    .collect();
                (slots, false)
            }
        };

        Self {
            params,
            trunk,
            heads: head_slots,
            shared_head,
            input_dim,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Number of classifier heads (1 when shared).
    pub fn n_heads(&self) -> usize {
        self.heads.len()
    }

    fn head(&self, task: TaskId) -> Result<LinearSlot> {
        if self.shared_head {
            return Ok(self.heads[0]);
        }
        self.heads.get(task).copied().ok_or_else(|| {
            GpmError::InvalidConfig(format!(
                "task {} has no classifier head ({} heads)",
                task,
                self.heads.len()
            ))
        })
    }

    fn linear(&self, slot: LinearSlot, x: &Array2<f32>) -> Array2<f32> {
        let w = &self.params[slot.weight].value;
        let mut z = x.dot(&w.t());
        if let Some(b) = slot.bias {
            z += &self.params[b].value;
        }
        z
    }

    /// Accumulate `dW`, `db` for `slot` into `grads` and return `dx`.
    fn linear_backward(
        &self,
        slot: LinearSlot,
        x: &Array2<f32>,
        g: &Array2<f32>,
        grads: &mut [Array2<f32>],
    ) -> Array2<f32> {
        grads[slot.weight] = g.t().dot(x);
        if let Some(b) = slot.bias {
            grads[b] = g.sum_axis(Axis(0)).insert_axis(Axis(0));
        }
        g.dot(&self.params[slot.weight].value)
    }
}

fn push_linear(
    params: &mut Vec<Parameter>,
    rng: &mut StdRng,
    name: &str,
    fan_in: usize,
    fan_out: usize,
    with_bias: bool,
    layer: Option<usize>,
) -> LinearSlot {
    let bound = (6.0 / fan_in.max(1) as f32).sqrt();
    let weight = Array2::from_shape_fn((fan_out, fan_in), |_| rng.gen_range(-bound..bound));

    let (w_role, b_role) = match layer {
        Some(layer) => (
            ParamRole::Projectable { layer, rank: 2 },
            ParamRole::LayerVector { layer },
        ),
        None => (ParamRole::Free, ParamRole::Free),
    };

    params.push(Parameter::new(&format!("{}.weight", name), w_role, weight));
    let weight = params.len() - 1;

    let bias = if with_bias {
        params.push(Parameter::new(
            &format!("{}.bias", name),
            b_role,
            Array2::zeros((1, fan_out)),
        ));
        Some(params.len() - 1)
    } else {
        None
    };

    LinearSlot { weight, bias }
}

impl Model for Mlp {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn layer_geometry(&self) -> Vec<LayerGeometry> {
        let mut geometry: Vec<LayerGeometry> = self
            .trunk
            .iter()
            .map(|slot| LayerGeometry::Dense {
                in_features: self.params[slot.weight].value.ncols(),
            })
            .collect();
        if self.shared_head {
            geometry.push(LayerGeometry::Dense {
                in_features: self.params[self.heads[0].weight].value.ncols(),
            });
        }
        geometry
    }

    fn forward(&self, input: &Array2<f32>, task: TaskId) -> Result<ForwardPass> {
        if input.ncols() != self.input_dim {
            return Err(GpmError::ShapeMismatch(format!(
                "input width {} != {}",
                input.ncols(),
                self.input_dim
            )));
        }
        let head = self.head(task)?;

        let mut captures = BTreeMap::new();
        let mut tape = Vec::with_capacity(self.trunk.len() + 1);
        let mut x = input.clone();

        for (layer, &slot) in self.trunk.iter().enumerate() {
            captures.insert(layer, Activation::Dense(x.clone()));
            let z = self.linear(slot, &x);
            tape.push(x);
            x = z.mapv(|v| v.max(0.0));
        }

        if self.shared_head {
            captures.insert(self.trunk.len(), Activation::Dense(x.clone()));
        }
        let output = self.linear(head, &x);
        tape.push(x);

        Ok(ForwardPass {
            output,
            captures,
            tape,
            task,
        })
    }

    fn backward(&self, pass: &ForwardPass, grad_output: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut grads: Vec<Array2<f32>> = self
            .params
            .iter()
            .map(|p| Array2::zeros(p.value.raw_dim()))
            .collect();

        // A pass produced by `forward` always has a valid head.
        let head = match self.head(pass.task) {
            Ok(slot) => slot,
            Err(_) => return grads,
        };

        let n = self.trunk.len();
        let mut g = self.linear_backward(head, &pass.tape[n], grad_output, &mut grads);

        for layer in (0..n).rev() {
            // ReLU mask: the output of `layer` is the input of `layer + 1`.
            let out = &pass.tape[layer + 1];
            g.zip_mut_with(out, |gv, &o| {
                if o <= 0.0 {
                    *gv = 0.0;
                }
            });
            g = self.linear_backward(self.trunk[layer], &pass.tape[layer], &g, &mut grads);
        }

        grads
    }
}
