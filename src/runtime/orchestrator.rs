//! The task loop.
//!
//! ```text
//! InitDistribution ─► Train(0) ─► MemoryUpdate(0) ─► Train(1) ─► MemoryUpdate(1) ─► … ─► Report ─► Done
//! ```
//!
//! - `InitDistribution`: one uncorrected forward pass per task with the
//!   untrained model fills the pre-training distribution store.
//! - `Train(0)`: plain gradient descent.
//! - `Train(k)`, `k ≥ 1`: the current model samples task `k` once into the
//!   post-training store, the discriminator picks similar earlier tasks per
//!   layer, then projected gradient descent with contrastive alignment runs.
//! - `MemoryUpdate(k)`: representations of task `k` are folded into the
//!   subspace memory and every task seen so far is tested.
//!
//! Any error aborts the run.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::report::AccuracyMatrix;
use super::trainer::{evaluate, Correction, TaskOutcome, Trainer, TrainingConfig};
use crate::config::{DEFAULT_ENERGY_THRESHOLD, DEFAULT_THRESHOLD_STEP};
use crate::core::model::{Model, TaskId};
use crate::data::task::Task;
use crate::error::GpmError;
use crate::learning::contrastive::ContrastiveAligner;
use crate::learning::projection::{ProjectionPlan, ProjectionStats};
use crate::memory::distribution::DistributionStore;
use crate::memory::gpm::{MemoryStats, SubspaceMemory, UpdateSummary};
use crate::sampling::representation::{RepresentationSampler, SamplerConfig};
use crate::similarity::discriminator::{SimilarTasks, SimilarityConfig, TaskDiscriminator};

/// Energy threshold per layer, growing with the task index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThresholdSchedule {
    /// Base threshold per layer. A single value applies to every layer.
    pub base: Vec<f64>,

    /// Added once per task index.
    pub per_task_step: f64,
}

impl Default for ThresholdSchedule {
    fn default() -> Self {
        Self {
            base: vec![DEFAULT_ENERGY_THRESHOLD],
            per_task_step: DEFAULT_THRESHOLD_STEP,
        }
    }
}

impl ThresholdSchedule {
    /// Thresholds of `n_layers` layers at `task`, capped at 1.
    pub fn thresholds(&self, task: TaskId, n_layers: usize) -> Result<Vec<f64>, GpmError> {
        let base = match self.base.len() {
            1 => vec![self.base[0]; n_layers],
            n if n == n_layers => self.base.clone(),
            n => {
                return Err(GpmError::InvalidConfig(format!(
                    "{} base thresholds for {} layers",
                    n, n_layers
                )))
            }
        };
        base.into_iter()
            .map(|b| {
                if !(b > 0.0 && b <= 1.0) {
                    return Err(GpmError::InvalidConfig(format!(
                        "base threshold {} outside (0, 1]",
                        b
                    )));
                }
                Ok((b + task as f64 * self.per_task_step).min(1.0))
            })
            .collect()
    }
}

/// Everything that parameterises one continual-learning run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub training: TrainingConfig,
    pub thresholds: ThresholdSchedule,
    pub similarity: SimilarityConfig,
    pub sampler: SamplerConfig,
}

/// Where the orchestrator is in the task loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    InitDistribution,
    Train(TaskId),
    MemoryUpdate(TaskId),
    Report,
    Done,
}

/// Per-task record kept for the final report.
#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub outcome: TaskOutcome,
    pub similar: SimilarTasks,
    pub projection: ProjectionStats,
    pub memory: UpdateSummary,
    pub test_accuracy: f64,
}

/// Result of a full run.
#[derive(Clone, Debug)]
pub struct ExperimentReport {
    pub accuracy: AccuracyMatrix,
    pub tasks: Vec<TaskRecord>,
    pub memory_stats: MemoryStats,
    pub average_accuracy: f64,
    pub backward_transfer: Option<f64>,
}

impl ExperimentReport {
    pub fn log(&self) {
        info!("accuracy matrix:\n{}", self.accuracy);
        info!("final average accuracy: {:5.2}%", self.average_accuracy);
        match self.backward_transfer {
            Some(bwt) => info!("backward transfer: {:5.2}%", bwt),
            None => info!("backward transfer: n/a (single task)"),
        }
        info!(
            updates = self.memory_stats.updates,
            overflow_events = self.memory_stats.overflow_events,
            skipped_layer_updates = self.memory_stats.skipped_layer_updates,
            degenerate_representations = self.memory_stats.degenerate_representations,
            "memory stats"
        );
    }
}

pub struct Orchestrator<M: Model> {
    model: M,
    memory: SubspaceMemory,
    pre: DistributionStore,
    post: DistributionStore,
    sampler: RepresentationSampler,
    discriminator: TaskDiscriminator,
    aligner: ContrastiveAligner,
    trainer: Trainer,
    thresholds: ThresholdSchedule,
    phase: Phase,
}

impl<M: Model> Orchestrator<M> {
    pub fn new(model: M, config: ExperimentConfig) -> Result<Self> {
        let dims: Vec<usize> = model
            .layer_geometry()
            .iter()
            .map(|g| g.feature_dim())
            .collect();
        if dims.is_empty() {
            bail!("model has no projectable layers");
        }
        // Validate the schedule once up front.
        config.thresholds.thresholds(0, dims.len())?;
        let trainer = Trainer::new(config.training.clone()).context("training configuration")?;

        Ok(Self {
            model,
            memory: SubspaceMemory::new(dims),
            pre: DistributionStore::pre(),
            post: DistributionStore::post(),
            sampler: RepresentationSampler::new(config.sampler),
            discriminator: TaskDiscriminator::new(config.similarity),
            aligner: ContrastiveAligner::new(config.training.contrastive_weight),
            trainer,
            thresholds: config.thresholds,
            phase: Phase::InitDistribution,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn memory(&self) -> &SubspaceMemory {
        &self.memory
    }

    pub fn pre_distribution(&self) -> &DistributionStore {
        &self.pre
    }

    pub fn post_distribution(&self) -> &DistributionStore {
        &self.post
    }

    /// Run the whole task sequence.
    pub fn run(&mut self, tasks: &[Task]) -> Result<ExperimentReport> {
        if self.phase != Phase::InitDistribution {
            bail!("orchestrator already ran (phase {:?})", self.phase);
        }
        for (i, task) in tasks.iter().enumerate() {
            if task.id != i {
                bail!("task at position {} has id {}", i, task.id);
            }
            task.validate()
                .with_context(|| format!("task {} ({})", task.id, task.name))?;
        }

        self.init_distribution(tasks)?;

        let mut accuracy = AccuracyMatrix::new(tasks.len());
        let mut records = Vec::with_capacity(tasks.len());

        for task in tasks {
            self.enter(Phase::Train(task.id));
            info!(task = task.id, name = %task.name, lr = self.trainer.config.lr, "starting task");
            let (outcome, similar, projection) = self
                .train(task)
                .with_context(|| format!("training task {}", task.id))?;

            let test = evaluate(&self.model, task.id, &task.test)?;
            info!(
                task = task.id,
                epochs = outcome.epochs_run,
                best_valid_loss = outcome.best_valid_loss,
                test_loss = test.loss,
                test_acc = test.accuracy,
                "task trained"
            );

            self.enter(Phase::MemoryUpdate(task.id));
            let summary = self
                .update_memory(task)
                .with_context(|| format!("memory update after task {}", task.id))?;
            summary.log();

            for earlier in &tasks[..=task.id] {
                let eval = evaluate(&self.model, earlier.id, &earlier.test)?;
                accuracy.record(task.id, earlier.id, eval.accuracy);
            }
            info!(task = task.id, row = ?accuracy.row(task.id), "accuracy");

            records.push(TaskRecord {
                outcome,
                similar,
                projection,
                memory: summary,
                test_accuracy: test.accuracy,
            });
        }

        self.enter(Phase::Report);
        let report = ExperimentReport {
            average_accuracy: accuracy.average_accuracy(),
            backward_transfer: accuracy.backward_transfer(),
            accuracy,
            tasks: records,
            memory_stats: self.memory.stats.clone(),
        };
        self.enter(Phase::Done);
        Ok(report)
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    /// One forward pass per task with the untrained model.
    fn init_distribution(&mut self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.sampler
                .sample(&self.model, task.id, &task.train, &mut self.pre)
                .with_context(|| format!("initial distribution of task {}", task.id))?;
        }
        info!(tasks = self.pre.n_tasks(), "initial task distributions recorded");
        Ok(())
    }

    fn train(&mut self, task: &Task) -> Result<(TaskOutcome, SimilarTasks, ProjectionStats)> {
        let n_layers = self.memory.n_layers();
        if task.id == 0 {
            let outcome = self.trainer.train_task(&mut self.model, task, Correction::None)?;
            return Ok((outcome, SimilarTasks::none(n_layers), ProjectionStats::default()));
        }

        // Snapshot of the current model's view of this task, before training.
        self.sampler
            .sample(&self.model, task.id, &task.train, &mut self.post)?;
        let similar = self
            .discriminator
            .similar_tasks(task.id, &self.pre, &self.post, n_layers)?;

        let mut plan = ProjectionPlan::from_memory(&self.memory, task.id);
        let outcome = self.trainer.train_task(
            &mut self.model,
            task,
            Correction::Projected {
                plan: &mut plan,
                similar: &similar,
                aligner: &self.aligner,
                memory: &self.memory,
            },
        )?;
        debug!(
            task = task.id,
            gradient_projections = plan.stats.gradient_projections,
            zeroed_vectors = plan.stats.zeroed_vectors,
            corrected_layers = plan.stats.corrected_layers,
            "projection stats"
        );
        Ok((outcome, similar, plan.stats))
    }

    fn update_memory(&mut self, task: &Task) -> Result<UpdateSummary> {
        let representations =
            self.sampler
                .sample(&self.model, task.id, &task.train, &mut self.post)?;
        let thresholds = self.thresholds.thresholds(task.id, self.memory.n_layers())?;
        debug!(task = task.id, ?thresholds, "energy thresholds");
        Ok(self.memory.update(task.id, &representations, &thresholds)?)
    }
}
