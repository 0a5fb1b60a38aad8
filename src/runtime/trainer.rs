//! Epoch and batch loops for one task.
//!
//! A task is trained either plainly or under a [`Correction`]. The projected
//! step is:
//!
//! 1. first step of the task only: swap in `W − W·P·Pᵗ` (weight correction)
//! 2. forward, cross-entropy, backward
//! 3. restore the stored weights
//! 4. add the contrastive alignment gradient
//! 5. project every gradient out of the protected subspaces
//! 6. SGD step

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS, DEFAULT_LR};
use crate::core::model::{Model, TaskId};
use crate::data::task::{Split, Task};
use crate::error::{GpmError, Result};
use crate::learning::contrastive::ContrastiveAligner;
use crate::learning::loss::cross_entropy;
use crate::learning::optimizer::{LrPolicy, LrScheduler, Sgd};
use crate::learning::projection::ProjectionPlan;
use crate::memory::gpm::SubspaceMemory;
use crate::similarity::discriminator::SimilarTasks;

/// Per-task training configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Maximum epochs per task.
    pub epochs: usize,

    pub batch_size: usize,

    /// Initial learning rate of every task.
    pub lr: f32,

    pub momentum: f32,

    pub lr_policy: LrPolicy,

    /// Multiplier on the contrastive alignment loss.
    pub contrastive_weight: f64,

    /// Seed of the batch shuffling RNG.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            lr: DEFAULT_LR,
            momentum: 0.0,
            lr_policy: LrPolicy::default(),
            contrastive_weight: 1.0,
            seed: 0,
        }
    }
}

/// How gradients of the current task are constrained.
pub enum Correction<'a> {
    /// Plain gradient descent (first task).
    None,

    /// Projected gradient descent plus contrastive alignment.
    Projected {
        plan: &'a mut ProjectionPlan,
        similar: &'a SimilarTasks,
        aligner: &'a ContrastiveAligner,
        memory: &'a SubspaceMemory,
    },
}

/// Mean loss and accuracy (%) over a split.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f64,
}

/// Statistics of one training epoch.
#[derive(Clone, Debug, Default)]
pub struct EpochStats {
    pub batches: usize,

    /// Mean cross-entropy over the epoch's batches.
    pub loss: f32,

    /// Mean contrastive loss over the epoch's batches.
    pub aux_loss: f64,
}

/// Outcome of training one task.
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub task: TaskId,
    pub epochs_run: usize,
    pub best_valid_loss: f32,
    pub final_lr: f32,
    pub stopped_early: bool,
    pub train: Evaluation,
    pub valid: Evaluation,
}

pub struct Trainer {
    pub config: TrainingConfig,
    rng: StdRng,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(GpmError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if !(config.lr > 0.0) {
            return Err(GpmError::InvalidConfig(format!(
                "learning rate {} must be positive",
                config.lr
            )));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { config, rng })
    }

    /// Train `task` for up to `config.epochs` epochs with a fresh optimizer.
    pub fn train_task<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        task: &Task,
        mut correction: Correction<'_>,
    ) -> Result<TaskOutcome> {
        let mut optimizer = Sgd::new(self.config.lr, self.config.momentum);
        let mut scheduler = LrScheduler::new(self.config.lr_policy.clone(), self.config.lr);
        let mut epochs_run = 0;
        let mut stopped_early = false;
        let mut train = Evaluation::default();
        let mut valid = Evaluation::default();

        for epoch in 1..=self.config.epochs {
            let start = Instant::now();
            let stats = self.train_epoch(model, task.id, &task.train, &mut optimizer, &mut correction)?;
            let elapsed = start.elapsed();
            epochs_run = epoch;

            train = evaluate(model, task.id, &task.train)?;
            valid = evaluate(model, task.id, &task.valid)?;
            let decision = scheduler.end_epoch(valid.loss);
            optimizer.lr = decision.lr;

            debug!(
                task = task.id,
                epoch,
                train_loss = train.loss,
                train_acc = train.accuracy,
                valid_loss = valid.loss,
                valid_acc = valid.accuracy,
                aux_loss = stats.aux_loss,
                improved = decision.improved,
                lr = decision.lr,
                ms = elapsed.as_millis() as u64,
                "epoch"
            );

            if decision.stop {
                warn!(task = task.id, epoch, lr = decision.lr, "learning rate below minimum, stopping early");
                stopped_early = true;
                break;
            }
        }

        Ok(TaskOutcome {
            task: task.id,
            epochs_run,
            best_valid_loss: scheduler.best_loss,
            final_lr: scheduler.lr(),
            stopped_early,
            train,
            valid,
        })
    }

    /// One pass over `split` in shuffled mini-batches.
    pub fn train_epoch<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        task: TaskId,
        split: &Split,
        optimizer: &mut Sgd,
        correction: &mut Correction<'_>,
    ) -> Result<EpochStats> {
        if split.is_empty() {
            return Err(GpmError::EmptySplit { task });
        }
        let mut order: Vec<usize> = (0..split.len()).collect();
        order.shuffle(&mut self.rng);

        let mut stats = EpochStats::default();
        let mut loss_sum = 0.0f32;
        let mut aux_sum = 0.0f64;

        for chunk in order.chunks(self.config.batch_size) {
            let (x, y) = split.batch(chunk);

            let grads = match correction {
                Correction::None => {
                    let pass = model.forward(&x, task)?;
                    let out = cross_entropy(&pass.output, &y)?;
                    loss_sum += out.loss;
                    model.backward(&pass, &out.grad)
                }
                Correction::Projected {
                    plan,
                    similar,
                    aligner,
                    memory,
                } => {
                    let stash = plan.correct_weights(model)?;
                    let step = model.forward(&x, task).and_then(|pass| {
                        let out = cross_entropy(&pass.output, &y)?;
                        Ok((model.backward(&pass, &out.grad), out.loss))
                    });
                    stash.restore(model);
                    let (mut grads, loss) = step?;
                    loss_sum += loss;

                    let aux = aligner.aux_loss(*memory, *similar, &*model, task)?;
                    aux_sum += aux.loss;
                    for (idx, g) in aux.grads {
                        add_into(&mut grads, idx, &g)?;
                    }

                    plan.project_gradients(model.parameters(), &mut grads)?;
                    grads
                }
            };

            optimizer.step(model.parameters_mut(), &grads)?;
            stats.batches += 1;
        }

        let batches = stats.batches.max(1);
        stats.loss = loss_sum / batches as f32;
        stats.aux_loss = aux_sum / batches as f64;
        Ok(stats)
    }
}

fn add_into(grads: &mut [Array2<f32>], idx: usize, g: &Array2<f32>) -> Result<()> {
    let target = grads.get_mut(idx).ok_or_else(|| {
        GpmError::ShapeMismatch(format!("no gradient slot {}", idx))
    })?;
    if target.dim() != g.dim() {
        return Err(GpmError::ShapeMismatch(format!(
            "alignment gradient {:?} vs parameter gradient {:?}",
            g.dim(),
            target.dim()
        )));
    }
    *target += g;
    Ok(())
}

/// Mean cross-entropy and accuracy (%) of `model` on `split`.
pub fn evaluate<M: Model + ?Sized>(model: &M, task: TaskId, split: &Split) -> Result<Evaluation> {
    if split.is_empty() {
        return Ok(Evaluation::default());
    }
    let pass = model.forward(&split.x, task)?;
    let out = cross_entropy(&pass.output, &split.y)?;
    Ok(Evaluation {
        loss: out.loss,
        accuracy: 100.0 * out.correct as f64 / split.len() as f64,
    })
}
