//! # subspace-gpm
//!
//! **Gradient Projection Memory with similarity-aware contrastive alignment**
//! for task-incremental continual learning.
//!
//! A single network learns a sequence of classification tasks. While task *t*
//! trains, gradient updates are projected away from the input subspaces that
//! mattered for tasks `0..t`, and a contrastive term pulls the weight
//! projections of similar earlier tasks together.
//!
//! ## Components
//!
//! 1. **RepresentationSampler**: one forward pass, per-layer activation
//!    matrices (dense transpose or receptive-field patches)
//! 2. **SubspaceMemory**: incremental SVD update of the per-layer protected
//!    basis under an energy threshold
//! 3. **TaskDiscriminator**: paired distribution distances before and after
//!    training pick at most two similar earlier tasks per layer
//! 4. **ProjectionEngine**: first-step weight correction and per-step
//!    gradient projection `g − g·B·Bᵗ`
//! 5. **ContrastiveAligner**: cosine/BCE penalty between weight projections
//!    onto per-task bases
//! 6. **TrainingOrchestrator**: the task loop and the accuracy matrix
//!
//! The network itself is a collaborator behind [`core::model::Model`];
//! [`core::mlp::Mlp`] is the reference implementation.

pub mod core;
pub mod data;
pub mod error;
pub mod learning;
pub mod memory;
pub mod runtime;
pub mod sampling;
pub mod similarity;

/// Engine-wide defaults.
pub mod config {
    /// Base energy threshold τ for every layer.
    pub const DEFAULT_ENERGY_THRESHOLD: f64 = 0.98;

    /// Per-task increase of τ (`τ_t = base + t · step`).
    pub const DEFAULT_THRESHOLD_STEP: f64 = 0.001;

    /// Rescaled-delta threshold for the task discriminator.
    pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

    /// Maximum number of similar tasks kept per layer.
    pub const MAX_SIMILAR_TASKS: usize = 2;

    /// Deltas below this are rescaled by a power of ten before thresholding.
    pub const SMALL_DELTA_CUTOFF: f64 = 0.1;

    /// Tolerance for `‖BᵗB − I‖_F`.
    pub const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

    /// Residual directions carrying less than this fraction of the total
    /// energy are never added to a basis.
    pub const NEGLIGIBLE_ENERGY: f64 = 1e-12;

    /// SVD convergence epsilon passed to nalgebra.
    pub const SVD_EPS: f64 = 1e-14;

    /// SVD iteration cap (0 = until convergence).
    pub const SVD_MAX_ITER: usize = 10_000;

    /// Class-balanced sampling: rounds over all classes (one example per
    /// class per round).
    pub const CONV_SAMPLE_ROUNDS: usize = 25;

    /// Flat random sample size for small MLPs.
    pub const MLP_SAMPLE_COUNT: usize = 15;

    /// Flat random sample size for deep residual networks.
    pub const RESIDUAL_SAMPLE_COUNT: usize = 100;

    /// Cosine-similarity norm clamp.
    pub const COSINE_EPS: f64 = 1e-8;

    /// Lower clamp on `ln` inside binary cross-entropy.
    pub const BCE_LOG_FLOOR: f64 = -100.0;

    /// Training defaults.
    pub const DEFAULT_LR: f32 = 0.01;
    pub const DEFAULT_BATCH_SIZE: usize = 64;
    pub const DEFAULT_EPOCHS: usize = 20;
    pub const DEFAULT_LR_PATIENCE: usize = 6;
    pub const DEFAULT_LR_FACTOR: f32 = 2.0;
    pub const DEFAULT_LR_MIN: f32 = 1e-5;
}
