//! Projection engine: keeps updates out of the protected subspaces.
//!
//! Built once per task from the subspace memory as it stood before the task
//! started. Two operations:
//!
//! - **Weight correction** (first step of a task only): every projectable
//!   weight with a previous-task projector `P` is replaced by
//!   `W − W·P·Pᵗ` for that step's forward/backward pass. The returned
//!   [`WeightStash`] puts the stored weights back before the optimizer step.
//! - **Gradient projection** (every step): `g ← g − g·F` with the full
//!   cumulative projector `F = B·Bᵗ`. Layer vectors (biases) are zeroed on
//!   every task after the first.

use ndarray::Array2;
use tracing::info;

use crate::core::linalg::to_f32;
use crate::core::model::{Model, ParamRole, Parameter, TaskId};
use crate::error::{GpmError, Result};
use crate::memory::gpm::SubspaceMemory;

/// Projection counters for one task.
#[derive(Clone, Debug, Default)]
pub struct ProjectionStats {
    pub gradient_projections: u64,
    pub zeroed_vectors: u64,
    pub corrected_layers: usize,
}

/// Weights replaced by [`ProjectionPlan::correct_weights`].
#[derive(Debug, Default)]
pub struct WeightStash {
    saved: Vec<(usize, Array2<f32>)>,
}

impl WeightStash {
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Put the original weights back.
    pub fn restore<M: Model + ?Sized>(self, model: &mut M) {
        let params = model.parameters_mut();
        for (idx, value) in self.saved {
            params[idx].value = value;
        }
    }
}

/// Per-task projection matrices.
#[derive(Clone, Debug)]
pub struct ProjectionPlan {
    pub task: TaskId,

    /// `F_i = B_i·B_iᵗ` of every projectable layer.
    pub feature_mats: Vec<Array2<f32>>,

    /// Previous task's projector `P_i` (`dim × r`), if non-empty.
    pub previous: Vec<Option<Array2<f32>>>,

    pub stats: ProjectionStats,

    corrected: bool,
}

impl ProjectionPlan {
    /// Plan for training `task` against the current contents of `memory`.
    pub fn from_memory(memory: &SubspaceMemory, task: TaskId) -> Self {
        let n = memory.n_layers();
        let mut feature_mats = Vec::with_capacity(n);
        let mut previous = Vec::with_capacity(n);

        for layer in 0..n {
            let f = to_f32(&memory.feature_projector(layer));
            info!(
                task,
                layer,
                rank = memory.rank(layer),
                shape = ?f.dim(),
                "projection matrix"
            );
            feature_mats.push(f);
            previous.push(
                memory
                    .previous_projector(task, layer)
                    .filter(|p| p.ncols() > 0)
                    .map(to_f32),
            );
        }

        Self {
            task,
            feature_mats,
            previous,
            stats: ProjectionStats::default(),
            corrected: false,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.feature_mats.len()
    }

    /// Whether the one-shot weight correction has already fired.
    pub fn is_corrected(&self) -> bool {
        self.corrected
    }

    /// Replace projectable weights by `W − W·P·Pᵗ`.
    ///
    /// Fires once per plan; later calls return an empty stash.
    pub fn correct_weights<M: Model + ?Sized>(&mut self, model: &mut M) -> Result<WeightStash> {
        let mut stash = WeightStash::default();
        if self.corrected {
            return Ok(stash);
        }
        self.corrected = true;

        for (layer, p) in self.previous.iter().enumerate() {
            let Some(p) = p else { continue };
            let Some(idx) = model.weight_index(layer) else {
                return Err(GpmError::ShapeMismatch(format!(
                    "model has no projectable weight for layer {}",
                    layer
                )));
            };
            let w = &mut model.parameters_mut()[idx].value;
            if w.ncols() != p.nrows() {
                return Err(GpmError::ShapeMismatch(format!(
                    "layer {} weight fan-in {} vs projector dimension {}",
                    layer,
                    w.ncols(),
                    p.nrows()
                )));
            }
            let corrected = &*w - &w.dot(p).dot(&p.t());
            stash.saved.push((idx, std::mem::replace(w, corrected)));
            self.stats.corrected_layers += 1;
        }
        Ok(stash)
    }

    /// Project `grads` (aligned with `params`) in place.
    pub fn project_gradients(
        &mut self,
        params: &[Parameter],
        grads: &mut [Array2<f32>],
    ) -> Result<()> {
        if params.len() != grads.len() {
            return Err(GpmError::ShapeMismatch(format!(
                "{} parameters but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        for (param, grad) in params.iter().zip(grads.iter_mut()) {
            match param.role {
                ParamRole::Projectable { layer, .. } => {
                    let Some(f) = self.feature_mats.get(layer) else {
                        continue;
                    };
                    if grad.ncols() != f.nrows() {
                        return Err(GpmError::ShapeMismatch(format!(
                            "gradient of {} has {} columns, projector is {}x{}",
                            param.name,
                            grad.ncols(),
                            f.nrows(),
                            f.ncols()
                        )));
                    }
                    *grad = project_out(grad, f);
                    self.stats.gradient_projections += 1;
                }
                ParamRole::LayerVector { .. } if self.task > 0 => {
                    grad.fill(0.0);
                    self.stats.zeroed_vectors += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// `g − g·F`.
pub fn project_out(grad: &Array2<f32>, feature_mat: &Array2<f32>) -> Array2<f32> {
    grad - &grad.dot(feature_mat)
}
