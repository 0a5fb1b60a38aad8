//! Gradient Projection Memory: the per-layer protected subspace.
//!
//! For every projectable layer the memory keeps
//! - the cumulative orthonormal basis `B` of all input subspaces learned so
//!   far (grown after each task, capped at the feature dimension),
//! - the raw per-task basis of each task (used only for similarity and the
//!   contrastive term),
//! - the per-task projector: the columns a task added to `B`, or the previous
//!   task's projector when it added nothing.
//!
//! Update rule per layer with energy threshold τ, where `S` are the singular
//! values of the representation `R` and `E = ΣS²`:
//!
//! ```text
//! r_task = #{ k : Σ_{j≤k} S_j² / E < τ }
//! first task:  B = U[:, :r_task]
//! otherwise:   R̂ = R − B·Bᵗ·R,   captured = (E − ‖R̂‖²) / E
//!              accept residual directions while captured < τ
//!              B = [B | Û[:, :r_new]]  truncated to `dim` columns
//! ```

use ndarray::{s, Array1, Array2};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::NEGLIGIBLE_ENERGY;
use crate::core::linalg::{energy_rank, hstack, orthonormality_error, thin_svd};
use crate::core::model::TaskId;
use crate::error::{GpmError, Result};

/// Counters kept across the whole run.
#[derive(Clone, Debug, Default)]
pub struct MemoryStats {
    /// Completed `update` calls.
    pub updates: u64,

    /// Layer updates whose merged basis exceeded the feature dimension.
    pub overflow_events: u64,

    /// Layer updates that added no new direction.
    pub skipped_layer_updates: u64,

    /// Representations with zero total energy.
    pub degenerate_representations: u64,
}

/// Outcome of one layer in one memory update.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerUpdate {
    pub layer: usize,

    /// Rank of the raw per-task basis.
    pub task_rank: usize,

    /// Columns added to the cumulative basis.
    pub added_rank: usize,

    /// Cumulative rank after the update.
    pub total_rank: usize,

    /// Feature dimension (row count).
    pub dim: usize,

    /// The merged basis was truncated to `dim` columns.
    pub overflowed: bool,

    /// The projector was inherited from the previous task.
    pub inherited: bool,
}

/// Outcome of one memory update.
#[derive(Clone, Debug)]
pub struct UpdateSummary {
    pub task: TaskId,
    pub layers: Vec<LayerUpdate>,
}

impl UpdateSummary {
    /// Log the gradient-constraint summary (`rank/dim` per layer).
    pub fn log(&self) {
        info!("gradient constraints after task {}", self.task);
        for l in &self.layers {
            let note = if l.overflowed {
                " (saturated)"
            } else if l.inherited {
                " (skipped, projector inherited)"
            } else {
                ""
            };
            info!("  layer {}: {}/{}{}", l.layer + 1, l.total_rank, l.dim, note);
        }
    }
}

/// Per-layer decomposition computed independently of the other layers.
struct Decomposition {
    task_basis: Array2<f64>,
    increment: Array2<f64>,
    degenerate: bool,
}

/// The subspace memory for all projectable layers of one model.
#[derive(Clone, Debug)]
pub struct SubspaceMemory {
    dims: Vec<usize>,

    /// Cumulative basis per layer; `None` until the layer's first update.
    bases: Vec<Option<Array2<f64>>>,

    /// Raw per-task basis, `[task][layer]`.
    task_bases: BTreeMap<TaskId, Vec<Array2<f64>>>,

    /// Per-task projector, `[task][layer]`.
    projectors: BTreeMap<TaskId, Vec<Array2<f64>>>,

    pub stats: MemoryStats,
}

impl SubspaceMemory {
    /// Empty memory for layers with the given feature dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        let n = dims.len();
        Self {
            dims,
            bases: vec![None; n],
            task_bases: BTreeMap::new(),
            projectors: BTreeMap::new(),
            stats: MemoryStats::default(),
        }
    }

    pub fn n_layers(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, layer: usize) -> usize {
        self.dims[layer]
    }

    /// Cumulative basis of `layer`, if it has been seeded.
    pub fn basis(&self, layer: usize) -> Option<&Array2<f64>> {
        self.bases.get(layer).and_then(|b| b.as_ref())
    }

    /// Cumulative rank of `layer` (0 before the first update).
    pub fn rank(&self, layer: usize) -> usize {
        self.basis(layer).map_or(0, |b| b.ncols())
    }

    /// Full cumulative projector `B·Bᵗ` of `layer` (zero before seeding).
    pub fn feature_projector(&self, layer: usize) -> Array2<f64> {
        match self.basis(layer) {
            Some(b) => b.dot(&b.t()),
            None => Array2::zeros((self.dims[layer], self.dims[layer])),
        }
    }

    /// Raw per-task basis.
    pub fn task_basis(&self, task: TaskId, layer: usize) -> Result<&Array2<f64>> {
        self.task_bases
            .get(&task)
            .and_then(|layers| layers.get(layer))
            .ok_or(GpmError::MissingBasis { task, layer })
    }

    pub fn projector(&self, task: TaskId, layer: usize) -> Option<&Array2<f64>> {
        self.projectors.get(&task).and_then(|layers| layers.get(layer))
    }

    /// Projector of the most recent task recorded strictly before `task`.
    pub fn previous_projector(&self, task: TaskId, layer: usize) -> Option<&Array2<f64>> {
        self.projectors
            .range(..task)
            .next_back()
            .and_then(|(_, layers)| layers.get(layer))
    }

    /// Most recent task with a recorded per-task basis.
    pub fn latest_task(&self) -> Option<TaskId> {
        self.task_bases.keys().next_back().copied()
    }

    /// Largest `‖BᵗB − I‖_F` over all seeded layers.
    pub fn max_orthonormality_error(&self) -> f64 {
        self.bases
            .iter()
            .flatten()
            .map(orthonormality_error)
            .fold(0.0, f64::max)
    }

    /// Fold the representations of `task` into the memory.
    ///
    /// `representations[i]` is the `(dim_i, samples)` matrix of layer `i`,
    /// `thresholds[i]` its energy threshold in `(0, 1]`.
    pub fn update(
        &mut self,
        task: TaskId,
        representations: &[Array2<f64>],
        thresholds: &[f64],
    ) -> Result<UpdateSummary> {
        let n = self.n_layers();
        if representations.len() != n {
            return Err(GpmError::LayerCount {
                expected: n,
                actual: representations.len(),
            });
        }
        if thresholds.len() != n {
            return Err(GpmError::LayerCount {
                expected: n,
                actual: thresholds.len(),
            });
        }
        for (layer, (rep, &tau)) in representations.iter().zip(thresholds).enumerate() {
            if !(tau > 0.0 && tau <= 1.0) {
                return Err(GpmError::InvalidConfig(format!(
                    "energy threshold {} for layer {} outside (0, 1]",
                    tau, layer
                )));
            }
            if rep.nrows() != self.dims[layer] {
                return Err(GpmError::ShapeMismatch(format!(
                    "layer {} representation has {} rows, memory dimension is {}",
                    layer,
                    rep.nrows(),
                    self.dims[layer]
                )));
            }
        }

        let bases = &self.bases;
        let decompositions: Vec<Decomposition> = (0..n)
            .into_par_iter()
            .map(|layer| {
                decompose(
                    layer,
                    &representations[layer],
                    bases[layer].as_ref(),
                    thresholds[layer],
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut task_bases = Vec::with_capacity(n);
        let mut projectors = Vec::with_capacity(n);
        let mut layers = Vec::with_capacity(n);

        for (layer, d) in decompositions.into_iter().enumerate() {
            let dim = self.dims[layer];
            let task_rank = d.task_basis.ncols();
            let added = d.increment.ncols();
            if d.degenerate {
                self.stats.degenerate_representations += 1;
                debug!(task, layer, "representation has zero energy");
            }

            let mut overflowed = false;
            let mut inherited = false;

            let projector = match self.bases[layer].take() {
                None => {
                    self.bases[layer] = Some(d.increment.clone());
                    d.increment
                }
                Some(basis) if added == 0 => {
                    self.bases[layer] = Some(basis);
                    self.stats.skipped_layer_updates += 1;
                    inherited = true;
                    self.previous_projector(task, layer)
                        .cloned()
                        .unwrap_or_else(|| Array2::zeros((dim, 0)))
                }
                Some(basis) => {
                    let (merged, projector, saturated) = merge_basis(&basis, &d.increment, dim);
                    if saturated {
                        overflowed = true;
                        self.stats.overflow_events += 1;
                        warn!(
                            task,
                            layer,
                            requested = basis.ncols() + added,
                            dim,
                            "base matrix saturated, truncating to full rank"
                        );
                    }
                    self.bases[layer] = Some(merged);
                    projector
                }
            };

            task_bases.push(d.task_basis);
            projectors.push(projector);
            layers.push(LayerUpdate {
                layer,
                task_rank,
                added_rank: if inherited { 0 } else { added.min(dim) },
                total_rank: self.rank(layer),
                dim,
                overflowed,
                inherited,
            });
        }

        self.task_bases.insert(task, task_bases);
        self.projectors.insert(task, projectors);
        self.stats.updates += 1;

        debug!(
            task,
            max_orthonormality_error = self.max_orthonormality_error(),
            "memory updated"
        );

        Ok(UpdateSummary { task, layers })
    }
}

/// Decompose one layer's representation against its current basis.
fn decompose(
    layer: usize,
    rep: &Array2<f64>,
    basis: Option<&Array2<f64>>,
    threshold: f64,
) -> Result<Decomposition> {
    let (rows, cols) = rep.dim();
    let svd = thin_svd(rep).ok_or(GpmError::SvdNonConvergence { layer, rows, cols })?;
    let total = svd.total_energy();
    let degenerate = !(total > 0.0);

    let r_task = energy_rank(&svd.singular_values, threshold);
    let task_basis = svd.leading(r_task);

    let increment = match basis {
        None => task_basis.clone(),
        Some(_) if degenerate => Array2::zeros((rows, 0)),
        Some(b) => {
            let residual = rep - &b.dot(&b.t().dot(rep));
            let res = thin_svd(&residual)
                .ok_or(GpmError::SvdNonConvergence { layer, rows, cols })?;
            let r_new = residual_rank(&res.singular_values, total, threshold);
            res.leading(r_new)
        }
    };

    Ok(Decomposition {
        task_basis,
        increment,
        degenerate,
    })
}

/// Number of residual directions to accept.
///
/// Starts from the energy already captured by the existing basis and accepts
/// residual singular values in order while the captured fraction is still
/// below `threshold`. The value examined once the fraction has reached
/// `threshold` is not accepted, nor is any direction of negligible energy.
pub fn residual_rank(residual: &Array1<f64>, total: f64, threshold: f64) -> usize {
    if !(total > 0.0) {
        return 0;
    }
    let residual_energy: f64 = residual.iter().map(|s| s * s).sum();
    let mut captured = (total - residual_energy) / total;
    let mut rank = 0;
    for s in residual.iter() {
        if captured >= threshold {
            break;
        }
        let ratio = s * s / total;
        if ratio <= NEGLIGIBLE_ENERGY {
            break;
        }
        captured += ratio;
        rank += 1;
    }
    rank
}

/// Append `increment` to `basis`, truncating to `dim` columns.
///
/// Returns the merged basis, the columns that were actually added, and
/// whether truncation happened.
pub fn merge_basis(
    basis: &Array2<f64>,
    increment: &Array2<f64>,
    dim: usize,
) -> (Array2<f64>, Array2<f64>, bool) {
    let old = basis.ncols();
    let merged = hstack(basis, increment);
    let (merged, saturated) = if merged.ncols() > dim {
        (merged.slice(s![.., 0..dim]).to_owned(), true)
    } else {
        (merged, false)
    };
    let start = old.min(merged.ncols());
    let added = merged.slice(s![.., start..]).to_owned();
    (merged, added, saturated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ORTHONORMAL_TOLERANCE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// `Σ_k s_k · e_{rows[k]} · v_kᵗ` with `v_k` the normalised indicator of
    /// column block `k` (blocks of `block` columns).
    fn planted(dim: usize, cols: usize, rows: &[usize], s: &[f64], block: usize) -> Array2<f64> {
        let mut m = Array2::zeros((dim, cols));
        let norm = (block as f64).sqrt();
        for (k, (&r, &sv)) in rows.iter().zip(s).enumerate() {
            for c in k * block..(k + 1) * block {
                m[[r, c]] = sv / norm;
            }
        }
        m
    }

    fn assert_same(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_planted_rank_and_projector_propagation() {
        let tau = [0.999];
        let mut mem = SubspaceMemory::new(vec![10]);

        // Energies 100, 64, 36, 0.25: cumulative ratios .4994 .8190 .99875 1.0
        let r0 = planted(10, 50, &[0, 1, 2, 3], &[10.0, 8.0, 6.0, 0.5], 12);
        let s0 = mem.update(0, &[r0], &tau).unwrap();
        assert_eq!(s0.layers[0].task_rank, 3);
        assert_eq!(mem.rank(0), 3);
        assert!(mem.max_orthonormality_error() < ORTHONORMAL_TOLERANCE);

        // Same subspace: nothing new to add.
        let r1 = planted(10, 50, &[2, 0, 1], &[5.0, 4.0, 3.0], 16);
        let s1 = mem.update(1, &[r1], &tau).unwrap();
        assert_eq!(s1.layers[0].added_rank, 0);
        assert!(s1.layers[0].inherited);
        assert_eq!(mem.rank(0), 3);
        assert_same(mem.projector(1, 0).unwrap(), mem.projector(0, 0).unwrap());
        assert_eq!(mem.stats.skipped_layer_updates, 1);

        // A new dominant direction grows the basis by one.
        let r2 = planted(10, 50, &[5, 0], &[10.0, 1.0], 20);
        let s2 = mem.update(2, &[r2], &tau).unwrap();
        assert_eq!(s2.layers[0].added_rank, 1);
        assert_eq!(mem.rank(0), 4);
        let p2 = mem.projector(2, 0).unwrap();
        assert_eq!(p2.ncols(), 1);
        assert!((p2[[5, 0]].abs() - 1.0).abs() < 1e-8);
        assert!(mem.max_orthonormality_error() < ORTHONORMAL_TOLERANCE);
    }

    #[test]
    fn test_zero_representation_leaves_basis_unchanged() {
        let tau = [0.97];
        let mut mem = SubspaceMemory::new(vec![6]);
        let r0 = planted(6, 20, &[0, 1], &[3.0, 2.0], 10);
        mem.update(0, &[r0], &tau).unwrap();
        let before = mem.basis(0).unwrap().clone();

        let summary = mem.update(1, &[Array2::zeros((6, 20))], &tau).unwrap();
        assert_eq!(summary.layers[0].task_rank, 0);
        assert_eq!(summary.layers[0].added_rank, 0);
        assert_same(mem.basis(0).unwrap(), &before);
        assert_eq!(mem.task_basis(1, 0).unwrap().ncols(), 0);
        assert_eq!(mem.stats.degenerate_representations, 1);
    }

    #[test]
    fn test_first_update_with_zero_energy() {
        let mut mem = SubspaceMemory::new(vec![4]);
        let summary = mem.update(0, &[Array2::zeros((4, 3))], &[0.9]).unwrap();
        assert_eq!(summary.layers[0].total_rank, 0);
        assert_eq!(mem.projector(0, 0).unwrap().dim(), (4, 0));
        assert_eq!(mem.feature_projector(0), Array2::<f64>::zeros((4, 4)));
    }

    #[test]
    fn test_rank_monotonic_and_bounded() {
        let dim = 8;
        let mut mem = SubspaceMemory::new(vec![dim, 5]);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut last = [0usize; 2];

        for task in 0..6 {
            let a = Array2::from_shape_fn((dim, 30), |_| normal.sample(&mut rng));
            let b = Array2::from_shape_fn((5, 12), |_| normal.sample(&mut rng));
            let tau = 0.9 + task as f64 * 0.01;
            mem.update(task, &[a, b], &[tau, tau]).unwrap();
            for layer in 0..2 {
                let r = mem.rank(layer);
                assert!(r >= last[layer], "rank decreased on layer {}", layer);
                assert!(r <= mem.dim(layer));
                last[layer] = r;
            }
            assert!(mem.max_orthonormality_error() < ORTHONORMAL_TOLERANCE);
        }
        assert_eq!(mem.stats.updates, 6);
        assert_eq!(mem.latest_task(), Some(5));
    }

    #[test]
    fn test_merge_basis_truncates_on_overflow() {
        let basis = Array2::from_shape_fn((3, 2), |(i, j)| if i == j { 1.0 } else { 0.0 });
        let increment = Array2::from_shape_fn((3, 2), |(i, j)| if i == j + 1 { 1.0 } else { 0.0 });
        let (merged, added, saturated) = merge_basis(&basis, &increment, 3);
        assert!(saturated);
        assert_eq!(merged.dim(), (3, 3));
        assert_eq!(added.dim(), (3, 1));
        assert_eq!(added[[2, 0]], 0.0);
        assert_eq!(added[[1, 0]], 1.0);

        let (merged, added, saturated) = merge_basis(&Array2::zeros((3, 0)), &increment, 3);
        assert!(!saturated);
        assert_eq!(merged.ncols(), 2);
        assert_eq!(added.ncols(), 2);
    }

    #[test]
    fn test_residual_rank_excludes_stopping_value() {
        // total 16, residual energies 4, 4, 1 -> captured starts at 7/16
        let res = Array1::from_vec(vec![2.0, 2.0, 1.0]);
        // 0.4375 -> 0.6875 -> 0.9375: the third value is examined at τ and rejected
        assert_eq!(residual_rank(&res, 16.0, 0.9375), 2);
        assert_eq!(residual_rank(&res, 16.0, 0.94), 3);
        assert_eq!(residual_rank(&res, 16.0, 0.4), 0);
        assert_eq!(residual_rank(&res, 0.0, 0.9), 0);
    }

    #[test]
    fn test_update_validates_inputs() {
        let mut mem = SubspaceMemory::new(vec![4, 4]);
        let r = Array2::ones((4, 2));
        assert!(matches!(
            mem.update(0, &[r.clone()], &[0.9]),
            Err(GpmError::LayerCount { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            mem.update(0, &[r.clone(), Array2::ones((3, 2))], &[0.9, 0.9]),
            Err(GpmError::ShapeMismatch(_))
        ));
        assert!(matches!(
            mem.update(0, &[r.clone(), r], &[0.9, 1.5]),
            Err(GpmError::InvalidConfig(_))
        ));
        assert!(matches!(mem.task_basis(0, 0), Err(GpmError::MissingBasis { .. })));
    }
}
