//! Contrastive subspace alignment between the current and similar tasks.
//!
//! For a projectable weight `W` (`out × d`), the current task basis `B_c` and
//! a similar task basis `B_s`:
//!
//! ```text
//! A = W·B_c·B_cᵗ,  S = W·B_s·B_sᵗ
//! cos_i = ⟨A_i, S_i⟩ / (max(‖A_i‖, ε)·max(‖S_i‖, ε))
//! c     = (mean_i cos_i + 1) / 2
//! L     = −max(ln c, −100)            (BCE against label 1)
//! ```
//!
//! `L` is averaged over the similar tasks of a layer and summed over layers.
//! The gradient w.r.t. `W` is returned so the trainer can add it to the
//! classification gradient before projection.

use ndarray::{Array1, Array2, Zip};

use crate::config::{BCE_LOG_FLOOR, COSINE_EPS};
use crate::core::linalg::{to_f32, to_f64};
use crate::core::model::{Model, TaskId};
use crate::error::{GpmError, Result};
use crate::memory::gpm::SubspaceMemory;
use crate::similarity::discriminator::SimilarTasks;

use super::loss::binary_cross_entropy;

/// Auxiliary loss and the gradients it contributes.
#[derive(Clone, Debug, Default)]
pub struct AlignmentLoss {
    /// Weighted loss value.
    pub loss: f64,

    /// `(parameter index, dL/dW)` for every layer that contributed.
    pub grads: Vec<(usize, Array2<f32>)>,

    /// Number of (layer, similar task) pairs evaluated.
    pub pairs: usize,
}

#[derive(Clone, Debug)]
pub struct ContrastiveAligner {
    /// Multiplier on the auxiliary loss.
    pub weight: f64,
}

impl Default for ContrastiveAligner {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

impl ContrastiveAligner {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }

    /// Alignment loss of `model` while training `task`.
    ///
    /// The current basis of each layer is the most recent per-task basis
    /// before `task`. Layers without similar tasks contribute nothing.
    pub fn aux_loss<M: Model + ?Sized>(
        &self,
        memory: &SubspaceMemory,
        similar: &SimilarTasks,
        model: &M,
        task: TaskId,
    ) -> Result<AlignmentLoss> {
        let mut out = AlignmentLoss::default();
        if task == 0 || self.weight == 0.0 {
            return Ok(out);
        }

        for (layer, tasks) in similar.per_layer.iter().enumerate() {
            if tasks.is_empty() {
                continue;
            }
            let idx = model.weight_index(layer).ok_or_else(|| {
                GpmError::ShapeMismatch(format!("no projectable weight for layer {}", layer))
            })?;
            let w = to_f64(&model.parameters()[idx].value);
            let current = memory.task_basis(task - 1, layer)?;
            if current.nrows() != w.ncols() {
                return Err(GpmError::ShapeMismatch(format!(
                    "layer {} basis has {} rows, weight fan-in is {}",
                    layer,
                    current.nrows(),
                    w.ncols()
                )));
            }

            let mut layer_loss = 0.0;
            let mut layer_grad = Array2::<f64>::zeros(w.raw_dim());
            for &t in tasks {
                let other = memory.task_basis(t, layer)?;
                let (l, g) = pair_loss(&w, current, other);
                layer_loss += l;
                layer_grad += &g;
            }

            let scale = self.weight / tasks.len() as f64;
            out.loss += layer_loss * scale;
            out.grads.push((idx, to_f32(&layer_grad.mapv(|v| v * scale))));
            out.pairs += tasks.len();
        }
        Ok(out)
    }
}

/// Loss and `dL/dW` for one (current, similar) basis pair.
pub fn pair_loss(
    w: &Array2<f64>,
    current: &Array2<f64>,
    similar: &Array2<f64>,
) -> (f64, Array2<f64>) {
    let a = w.dot(current).dot(&current.t());
    let s = w.dot(similar).dot(&similar.t());
    let rows = w.nrows().max(1) as f64;

    let norms_a: Array1<f64> = a.rows().into_iter().map(|r| r.dot(&r).sqrt()).collect();
    let norms_s: Array1<f64> = s.rows().into_iter().map(|r| r.dot(&r).sqrt()).collect();

    let mut cos = Array1::zeros(w.nrows());
    for i in 0..w.nrows() {
        let denom = norms_a[i].max(COSINE_EPS) * norms_s[i].max(COSINE_EPS);
        cos[i] = a.row(i).dot(&s.row(i)) / denom;
    }
    let c = (cos.sum() / rows + 1.0) / 2.0;
    let loss = binary_cross_entropy(c, 1.0);

    // dL/dc is zero once the log clamp is active.
    let dl_dc = if c.ln() > BCE_LOG_FLOOR { -1.0 / c } else { 0.0 };
    let dl_dcos = dl_dc / (2.0 * rows);

    let mut grad_a = Array2::zeros(a.raw_dim());
    let mut grad_s = Array2::zeros(s.raw_dim());
    for i in 0..w.nrows() {
        let (na, ns) = (norms_a[i], norms_s[i]);
        let denom = na.max(COSINE_EPS) * ns.max(COSINE_EPS);
        let a_i = a.row(i);
        let s_i = s.row(i);

        let mut ga = grad_a.row_mut(i);
        Zip::from(&mut ga).and(&s_i).and(&a_i).for_each(|g, &sv, &av| {
            let mut d = sv / denom;
            if na > COSINE_EPS {
                d -= cos[i] * av / (na * na);
            }
            *g = dl_dcos * d;
        });

        let mut gs = grad_s.row_mut(i);
        Zip::from(&mut gs).and(&a_i).and(&s_i).for_each(|g, &av, &sv| {
            let mut d = av / denom;
            if ns > COSINE_EPS {
                d -= cos[i] * sv / (ns * ns);
            }
            *g = dl_dcos * d;
        });
    }

    // Both projectors are symmetric.
    let grad = grad_a.dot(current).dot(&current.t()) + grad_s.dot(similar).dot(&similar.t());
    (loss, grad)
}
