//! Task discriminator: which earlier tasks look like the current one.
//!
//! Per layer and earlier task `t`:
//!
//! ```text
//! ori[t]   = D(pre[current],  pre[t])
//! new[t]   = D(post[current], post[t])
//! delta[t] = |ori[t] − new[t]|, rescaled by 10^(⌈−log10 delta⌉ − 1) when < 0.1
//! similar  ⇔ new[t] < ori[t]  ∧  delta[t] > threshold
//! ```
//!
//! When more tasks qualify than the keep rule allows, the rule picks which
//! survive.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::distance::{DistanceKind, TaskDistance};
use crate::config::{DEFAULT_SIMILARITY_THRESHOLD, MAX_SIMILAR_TASKS, SMALL_DELTA_CUTOFF};
use crate::core::model::TaskId;
use crate::error::Result;
use crate::memory::distribution::DistributionStore;

/// Which flagged tasks survive when more than the rule's count qualify.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepRule {
    /// The `n` largest rescaled deltas.
    Largest(usize),

    /// The `n` smallest rescaled deltas.
    Smallest(usize),

    /// Everything except the `n` largest rescaled deltas.
    AllButLargest(usize),
}

impl KeepRule {
    /// Default rule of each distance kind.
    pub fn default_for(kind: DistanceKind) -> Self {
        match kind {
            DistanceKind::Wasserstein => KeepRule::Largest(MAX_SIMILAR_TASKS),
            DistanceKind::Euclidean => KeepRule::Smallest(MAX_SIMILAR_TASKS),
        }
    }

    fn limit(&self) -> usize {
        match *self {
            KeepRule::Largest(n) | KeepRule::Smallest(n) | KeepRule::AllButLargest(n) => n,
        }
    }

    /// Filter `(task, delta)` pairs; returns task ids in ascending order.
    pub fn apply(&self, mut flagged: Vec<(TaskId, f64)>) -> Vec<TaskId> {
        let n = self.limit();
        if flagged.len() > n {
            // Stable ascending sort by delta.
            flagged.sort_by(|a, b| a.1.total_cmp(&b.1));
            let len = flagged.len();
            flagged = match *self {
                KeepRule::Largest(_) => flagged.split_off(len - n),
                KeepRule::Smallest(_) => {
                    flagged.truncate(n);
                    flagged
                }
                KeepRule::AllButLargest(_) => {
                    flagged.truncate(len - n);
                    flagged
                }
            };
        }
        let mut tasks: Vec<TaskId> = flagged.into_iter().map(|(t, _)| t).collect();
        tasks.sort_unstable();
        tasks
    }
}

/// Discriminator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimilarityConfig {
    pub distance: DistanceKind,

    /// Rescaled-delta threshold (strict).
    pub threshold: f64,

    /// `None` uses the distance kind's default rule.
    pub keep: Option<KeepRule>,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            distance: DistanceKind::Wasserstein,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            keep: None,
        }
    }
}

impl SimilarityConfig {
    pub fn keep_rule(&self) -> KeepRule {
        self.keep.unwrap_or_else(|| KeepRule::default_for(self.distance))
    }
}

/// Similar earlier tasks, per projectable layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimilarTasks {
    pub per_layer: Vec<Vec<TaskId>>,
}

impl SimilarTasks {
    /// No similar task on `n_layers` layers.
    pub fn none(n_layers: usize) -> Self {
        Self {
            per_layer: vec![Vec::new(); n_layers],
        }
    }

    pub fn layer(&self, layer: usize) -> &[TaskId] {
        self.per_layer.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.per_layer.iter().all(|v| v.is_empty())
    }
}

/// Bring a small delta up to the order of magnitude of the threshold.
///
/// Deltas in `(0, 0.1)` are multiplied by `10^(⌈−log10 d⌉ − 1)`; others
/// (including 0) are returned unchanged.
pub fn rescale(delta: f64) -> f64 {
    if delta > 0.0 && delta < SMALL_DELTA_CUTOFF {
        let exponent = (-delta.log10()).ceil() - 1.0;
        delta * 10f64.powf(exponent)
    } else {
        delta
    }
}

pub struct TaskDiscriminator {
    pub config: SimilarityConfig,
    metric: Box<dyn TaskDistance>,
}

impl TaskDiscriminator {
    pub fn new(config: SimilarityConfig) -> Self {
        let metric = config.distance.metric();
        Self { config, metric }
    }

    /// Similar tasks for the `(ori, new)` distance lists of one layer.
    pub fn classify(&self, ori: &[f64], new: &[f64]) -> Vec<TaskId> {
        let flagged: Vec<(TaskId, f64)> = ori
            .iter()
            .zip(new)
            .enumerate()
            .filter_map(|(t, (&o, &n))| {
                let delta = rescale((o - n).abs());
                (n < o && delta > self.config.threshold).then_some((t, delta))
            })
            .collect();
        self.config.keep_rule().apply(flagged)
    }

    /// `(ori, new)` distances of `task` against every earlier task on `layer`.
    pub fn distances(
        &self,
        task: TaskId,
        layer: usize,
        pre: &DistributionStore,
        post: &DistributionStore,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let pre_cur = pre.first(task, layer)?;
        let post_cur = post.first(task, layer)?;
        let mut ori = Vec::with_capacity(task);
        let mut new = Vec::with_capacity(task);
        for t in 0..task {
            ori.push(self.metric.distance(pre_cur, pre.first(t, layer)?)?);
            new.push(self.metric.distance(post_cur, post.first(t, layer)?)?);
        }
        Ok((ori, new))
    }

    /// Similar earlier tasks of `task` on each of `n_layers` layers.
    pub fn similar_tasks(
        &self,
        task: TaskId,
        pre: &DistributionStore,
        post: &DistributionStore,
        n_layers: usize,
    ) -> Result<SimilarTasks> {
        let mut per_layer = Vec::with_capacity(n_layers);
        for layer in 0..n_layers {
            let (ori, new) = self.distances(task, layer, pre, post)?;
            debug!(task, layer, ?ori, ?new, metric = self.metric.name(), "task distances");
            let similar = self.classify(&ori, &new);
            info!(task, layer, ?similar, "similar tasks");
            per_layer.push(similar);
        }
        Ok(SimilarTasks { per_layer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpmError;
    use ndarray::Array2;

    fn disc(threshold: f64) -> TaskDiscriminator {
        TaskDiscriminator::new(SimilarityConfig {
            threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_rescale() {
        assert!((rescale(0.05) - 0.5).abs() < 1e-12);
        assert!((rescale(0.0031) - 0.31).abs() < 1e-12);
        assert_eq!(rescale(0.15), 0.15);
        assert_eq!(rescale(0.0), 0.0);
    }

    #[test]
    fn test_large_deltas_are_not_rescaled() {
        // deltas 0.2 and 0.15: both ≥ 0.1, task 1 diverged (new > ori).
        let d = disc(0.1);
        assert_eq!(d.classify(&[0.5, 0.05], &[0.3, 0.2]), vec![0]);
    }

    #[test]
    fn test_small_delta_rescaled_into_range() {
        // delta[1] = 0.05 -> 0.5 after rescaling, which clears 0.1.
        let d = disc(0.1);
        assert_eq!(d.classify(&[0.5, 0.25], &[0.3, 0.2]), vec![0, 1]);
        // Without rescaling 0.05 would fail a 0.3 threshold; with it, it passes.
        let d = disc(0.3);
        assert_eq!(d.classify(&[0.5, 0.25], &[0.6, 0.2]), vec![1]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let d = disc(0.25);
        assert!(d.classify(&[0.75], &[0.5]).is_empty());
        let d = disc(0.2499);
        assert_eq!(d.classify(&[0.75], &[0.5]), vec![0]);
    }

    #[test]
    fn test_keep_rules() {
        let flagged = vec![(0, 0.9), (1, 0.3), (2, 0.7), (3, 0.5)];
        assert_eq!(KeepRule::Largest(2).apply(flagged.clone()), vec![0, 2]);
        assert_eq!(KeepRule::Smallest(2).apply(flagged.clone()), vec![1, 3]);
        assert_eq!(KeepRule::AllButLargest(2).apply(flagged.clone()), vec![1, 3]);
        assert_eq!(KeepRule::Largest(2).apply(flagged[..2].to_vec()), vec![0, 1]);
    }

    #[test]
    fn test_default_keep_rule_by_kind() {
        let config = SimilarityConfig {
            distance: DistanceKind::Euclidean,
            ..Default::default()
        };
        assert_eq!(config.keep_rule(), KeepRule::Smallest(2));
        assert_eq!(SimilarityConfig::default().keep_rule(), KeepRule::Largest(2));
    }

    #[test]
    fn test_similar_tasks_from_stores() {
        let mut pre = DistributionStore::pre();
        let mut post = DistributionStore::post();
        let snap = |v: f64| Array2::from_elem((1, 4), v);

        // Before training task 1 sits 2.0 away from task 0, afterwards 0.5.
        pre.record(0, 0, &snap(0.0));
        pre.record(1, 0, &snap(2.0));
        post.record(0, 0, &snap(1.0));
        post.record(1, 0, &snap(1.5));

        let d = disc(0.8);
        let (ori, new) = d.distances(1, 0, &pre, &post).unwrap();
        assert!((ori[0] - 2.0).abs() < 1e-12);
        assert!((new[0] - 0.5).abs() < 1e-12);

        let sim = d.similar_tasks(1, &pre, &post, 1).unwrap();
        assert_eq!(sim.layer(0), &[0]);
        assert!(d.similar_tasks(0, &pre, &post, 1).unwrap().is_empty());
    }

    #[test]
    fn test_missing_snapshot_fails() {
        let mut pre = DistributionStore::pre();
        let post = DistributionStore::post();
        pre.record(1, 0, &Array2::zeros((1, 1)));
        assert!(matches!(
            disc(0.8).similar_tasks(1, &pre, &post, 1),
            Err(GpmError::MissingSnapshot { .. })
        ));
    }
}
