//! SGD with momentum and per-epoch learning-rate policies.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_LR_FACTOR, DEFAULT_LR_MIN, DEFAULT_LR_PATIENCE};
use crate::core::model::Parameter;
use crate::error::{GpmError, Result};

/// Plain SGD: `v ← μ·v + g`, `θ ← θ − lr·v`.
#[derive(Clone, Debug)]
pub struct Sgd {
    pub lr: f32,
    pub momentum: f32,
    velocity: Vec<Option<Array2<f32>>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }

    pub fn step(&mut self, params: &mut [Parameter], grads: &[Array2<f32>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(GpmError::ShapeMismatch(format!(
                "{} parameters but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        if self.velocity.len() != params.len() {
            self.velocity = vec![None; params.len()];
        }

        let (lr, momentum) = (self.lr, self.momentum);
        for ((param, grad), vel) in params.iter_mut().zip(grads).zip(self.velocity.iter_mut()) {
            if param.value.dim() != grad.dim() {
                return Err(GpmError::ShapeMismatch(format!(
                    "gradient of {} is {:?}, parameter is {:?}",
                    param.name,
                    grad.dim(),
                    param.value.dim()
                )));
            }
            if momentum == 0.0 {
                param.value.scaled_add(-lr, grad);
                continue;
            }
            let v = vel.get_or_insert_with(|| Array2::zeros(grad.raw_dim()));
            v.mapv_inplace(|x| x * momentum);
            *v += grad;
            param.value.scaled_add(-lr, v);
        }
        Ok(())
    }
}

/// Per-epoch learning-rate policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LrPolicy {
    Constant,

    /// Divide the rate by `factor` after `patience` epochs without a new
    /// best validation loss; stop once it falls below `lr_min`.
    Patience {
        patience: usize,
        factor: f32,
        lr_min: f32,
    },

    /// Cosine annealing from the base rate to zero over `t_max` epochs.
    Cosine { t_max: usize },
}

impl Default for LrPolicy {
    fn default() -> Self {
        LrPolicy::Patience {
            patience: DEFAULT_LR_PATIENCE,
            factor: DEFAULT_LR_FACTOR,
            lr_min: DEFAULT_LR_MIN,
        }
    }
}

/// What the scheduler decided at the end of an epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochDecision {
    /// New best validation loss.
    pub improved: bool,

    /// Learning rate for the next epoch.
    pub lr: f32,

    /// Stop training this task.
    pub stop: bool,
}

#[derive(Clone, Debug)]
pub struct LrScheduler {
    pub policy: LrPolicy,
    base_lr: f32,
    lr: f32,
    epoch: usize,
    patience_left: usize,
    pub best_loss: f32,
}

impl LrScheduler {
    pub fn new(policy: LrPolicy, base_lr: f32) -> Self {
        let patience_left = match policy {
            LrPolicy::Patience { patience, .. } => patience,
            _ => 0,
        };
        Self {
            policy,
            base_lr,
            lr: base_lr,
            epoch: 0,
            patience_left,
            best_loss: f32::INFINITY,
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Record the validation loss of the epoch that just ended.
    pub fn end_epoch(&mut self, valid_loss: f32) -> EpochDecision {
        self.epoch += 1;
        let improved = valid_loss < self.best_loss;
        if improved {
            self.best_loss = valid_loss;
        }

        let mut stop = false;
        match self.policy {
            LrPolicy::Constant => {}
            LrPolicy::Patience {
                patience,
                factor,
                lr_min,
            } => {
                if improved {
                    self.patience_left = patience;
                } else {
                    self.patience_left = self.patience_left.saturating_sub(1);
                    if self.patience_left == 0 {
                        self.lr /= factor;
                        if self.lr < lr_min {
                            stop = true;
                        } else {
                            self.patience_left = patience;
                        }
                    }
                }
            }
            LrPolicy::Cosine { t_max } => {
                let t = self.epoch.min(t_max.max(1)) as f32 / t_max.max(1) as f32;
                self.lr = self.base_lr * 0.5 * (1.0 + (std::f32::consts::PI * t).cos());
            }
        }

        EpochDecision {
            improved,
            lr: self.lr,
            stop,
        }
    }
}
