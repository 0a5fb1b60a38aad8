//! Representation sampling: one forward pass, one matrix per layer.
//!
//! A small subset of the training split is pushed through the model without
//! any correction. For each projectable layer the captured *input* is turned
//! into a `(features × samples)` matrix:
//! - dense layer: the first `bsz` activation rows, transposed;
//! - convolution: the receptive-field patch matrix of the first `bsz`
//!   samples (see [`super::patches`]).
//!
//! Every matrix is also appended, flattened, to a [`DistributionStore`].

use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::patches::extract_patches;
use crate::config::{CONV_SAMPLE_ROUNDS, MLP_SAMPLE_COUNT, RESIDUAL_SAMPLE_COUNT};
use crate::core::model::{Activation, LayerGeometry, Model, TaskId};
use crate::data::task::Split;
use crate::error::{GpmError, Result};
use crate::memory::distribution::DistributionStore;

/// Which training examples feed the forward pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// `rounds` passes over the classes, one example per class per pass.
    ClassBalanced { rounds: usize },

    /// `count` examples drawn uniformly without replacement.
    Random { count: usize },
}

/// Sampler configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub selection: SelectionPolicy,

    /// Samples used per layer. `None` uses every selected example.
    pub layer_batches: Option<Vec<usize>>,

    /// RNG seed; the order is reshuffled on every call.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            selection: SelectionPolicy::Random {
                count: MLP_SAMPLE_COUNT,
            },
            layer_batches: None,
            seed: 0,
        }
    }
}

impl SamplerConfig {
    /// Class-balanced rounds sized for convolutional networks.
    pub fn class_balanced(seed: u64) -> Self {
        Self {
            selection: SelectionPolicy::ClassBalanced {
                rounds: CONV_SAMPLE_ROUNDS,
            },
            layer_batches: None,
            seed,
        }
    }

    /// Random draw sized for deep residual networks, with optional
    /// per-layer sample caps.
    pub fn residual(seed: u64, layer_batches: Option<Vec<usize>>) -> Self {
        Self {
            selection: SelectionPolicy::Random {
                count: RESIDUAL_SAMPLE_COUNT,
            },
            layer_batches,
            seed,
        }
    }
}

pub struct RepresentationSampler {
    pub config: SamplerConfig,
    rng: StdRng,
}

impl RepresentationSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Indices into `labels` chosen by the selection policy.
    pub fn select(&mut self, labels: &[usize]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.shuffle(&mut self.rng);

        match self.config.selection {
            SelectionPolicy::Random { count } => {
                order.truncate(count.min(labels.len()));
                order
            }
            SelectionPolicy::ClassBalanced { rounds } => {
                let mut per_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for idx in order {
                    per_class.entry(labels[idx]).or_default().push(idx);
                }
                let mut picked = Vec::with_capacity(rounds * per_class.len());
                for round in 0..rounds {
                    for queue in per_class.values() {
                        if let Some(&idx) = queue.get(round) {
                            picked.push(idx);
                        }
                    }
                }
                picked
            }
        }
    }

    /// Representation matrices of `task`, one per projectable layer.
    pub fn sample<M: Model + ?Sized>(
        &mut self,
        model: &M,
        task: TaskId,
        split: &Split,
        store: &mut DistributionStore,
    ) -> Result<Vec<Array2<f64>>> {
        if split.is_empty() {
            return Err(GpmError::EmptySplit { task });
        }
        let indices = self.select(&split.y);
        let x = split.x.select(Axis(0), &indices);
        let pass = model.forward(&x, task)?;
        let geometry = model.layer_geometry();

        let mut mats = Vec::with_capacity(geometry.len());
        for (layer, geo) in geometry.iter().enumerate() {
            let capture = pass.captures.get(&layer).ok_or_else(|| {
                GpmError::ShapeMismatch(format!("no activation captured for layer {}", layer))
            })?;
            let bsz = self
                .config
                .layer_batches
                .as_ref()
                .and_then(|b| b.get(layer).copied())
                .unwrap_or(usize::MAX)
                .min(capture.batch_size());

            let mat = match (capture, geo) {
                (Activation::Dense(a), LayerGeometry::Dense { .. }) => {
                    a.slice(s![0..bsz, ..]).t().mapv(|v| v as f64)
                }
                (Activation::Spatial(a), LayerGeometry::Conv { .. }) => {
                    extract_patches(a, geo, bsz)?
                }
                _ => {
                    return Err(GpmError::ShapeMismatch(format!(
                        "layer {} capture does not match its geometry",
                        layer
                    )))
                }
            };

            debug!(task, layer, rows = mat.nrows(), cols = mat.ncols(), "representation");
            store.record(task, layer, &mat);
            mats.push(mat);
        }
        Ok(mats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mlp::{HeadLayout, Mlp};
    use crate::core::model::{ForwardPass, Parameter};
    use ndarray::Array4;

    fn split(n: usize, dim: usize, classes: usize) -> Split {
        let x = Array2::from_shape_fn((n, dim), |(i, j)| (i * dim + j) as f32 * 0.01);
        let y = (0..n).map(|i| i % classes).collect();
        Split::new(x, y).unwrap()
    }

    /// Reshapes its input to `(N, 2, 3, 3)` and captures it for one conv layer.
    struct ConvProbe;

    impl Model for ConvProbe {
        fn parameters(&self) -> &[Parameter] {
            &[]
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut []
        }

        fn layer_geometry(&self) -> Vec<LayerGeometry> {
            vec![LayerGeometry::Conv {
                in_channels: 2,
                kernel: 3,
                stride: 1,
                padding: 1,
            }]
        }

        fn forward(&self, input: &Array2<f32>, task: TaskId) -> Result<ForwardPass> {
            let n = input.nrows();
            let act = Array4::from_shape_fn((n, 2, 3, 3), |(b, c, y, x)| {
                input[[b, c * 9 + y * 3 + x]]
            });
            let mut captures = BTreeMap::new();
            captures.insert(0, Activation::Spatial(act));
            Ok(ForwardPass {
                output: Array2::zeros((n, 1)),
                captures,
                tape: Vec::new(),
                task,
            })
        }

        fn backward(&self, _pass: &ForwardPass, _grad: &Array2<f32>) -> Vec<Array2<f32>> {
            Vec::new()
        }
    }

    #[test]
    fn test_dense_representation_is_transposed_batch() {
        let mlp = Mlp::new(3, &[4], HeadLayout::PerTask(vec![2]), false, 0);
        let data = split(20, 3, 2);
        let mut sampler = RepresentationSampler::new(SamplerConfig {
            selection: SelectionPolicy::Random { count: 5 },
            layer_batches: None,
            seed: 3,
        });
        let mut store = DistributionStore::post();
        let mats = sampler.sample(&mlp, 0, &data, &mut store).unwrap();
        assert_eq!(mats.len(), 1);
        assert_eq!(mats[0].dim(), (3, 5));
        assert_eq!(store.count(0, 0), 1);
        assert_eq!(store.first(0, 0).unwrap().len(), 15);

        // Every column is one of the training rows.
        for col in mats[0].columns() {
            let hit = data.x.rows().into_iter().any(|row| {
                row.iter().zip(col.iter()).all(|(&a, &b)| (a as f64 - b).abs() < 1e-9)
            });
            assert!(hit);
        }
    }

    #[test]
    fn test_layer_batches_truncate() {
        let mlp = Mlp::new(3, &[4, 4], HeadLayout::PerTask(vec![2]), true, 0);
        let data = split(30, 3, 2);
        let mut sampler = RepresentationSampler::new(SamplerConfig {
            selection: SelectionPolicy::Random { count: 10 },
            layer_batches: Some(vec![4, 100]),
            seed: 1,
        });
        let mut store = DistributionStore::pre();
        let mats = sampler.sample(&mlp, 0, &data, &mut store).unwrap();
        assert_eq!(mats[0].dim(), (3, 4));
        assert_eq!(mats[1].dim(), (4, 10));
    }

    #[test]
    fn test_class_balanced_selection() {
        let labels: Vec<usize> = (0..30).map(|i| i % 3).collect();
        let mut sampler = RepresentationSampler::new(SamplerConfig {
            selection: SelectionPolicy::ClassBalanced { rounds: 4 },
            layer_batches: None,
            seed: 9,
        });
        let picked = sampler.select(&labels);
        assert_eq!(picked.len(), 12);
        for class in 0..3 {
            assert_eq!(picked.iter().filter(|&&i| labels[i] == class).count(), 4);
        }
        let mut unique = picked.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 12);
    }

    #[test]
    fn test_selection_is_seeded_and_reshuffled() {
        let labels = vec![0usize; 50];
        let config = SamplerConfig {
            selection: SelectionPolicy::Random { count: 10 },
            layer_batches: None,
            seed: 42,
        };
        let mut a = RepresentationSampler::new(config.clone());
        let mut b = RepresentationSampler::new(config);
        let first = a.select(&labels);
        assert_eq!(first, b.select(&labels));
        assert_ne!(first, a.select(&labels));
    }

    #[test]
    fn test_conv_representation_uses_patches() {
        let data = split(6, 18, 2);
        let mut sampler = RepresentationSampler::new(SamplerConfig {
            selection: SelectionPolicy::Random { count: 4 },
            layer_batches: Some(vec![2]),
            seed: 0,
        });
        let mut store = DistributionStore::pre();
        let mats = sampler.sample(&ConvProbe, 1, &data, &mut store).unwrap();
        // 2·3·3 rows, 3×3 positions × 2 samples.
        assert_eq!(mats[0].dim(), (18, 18));
        assert_eq!(store.count(1, 0), 1);
    }

    #[test]
    fn test_empty_split() {
        let mlp = Mlp::new(3, &[4], HeadLayout::Shared(2), false, 0);
        let empty = Split::new(Array2::zeros((0, 3)), vec![]).unwrap();
        let mut sampler = RepresentationSampler::new(SamplerConfig::default());
        let mut store = DistributionStore::pre();
        assert!(matches!(
            sampler.sample(&mlp, 2, &empty, &mut store),
            Err(GpmError::EmptySplit { task: 2 })
        ));
    }

    #[test]
    fn test_presets() {
        let conv = SamplerConfig::class_balanced(3);
        assert_eq!(conv.selection, SelectionPolicy::ClassBalanced { rounds: 25 });
        let res = SamplerConfig::residual(1, Some(vec![10, 125]));
        assert_eq!(res.selection, SelectionPolicy::Random { count: 100 });
        assert_eq!(res.layer_batches, Some(vec![10, 125]));
    }
}
