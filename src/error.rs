//! Library error type.
//!
//! Recoverable numeric conditions (subspace overflow, all-zero
//! representations, layers without similar tasks) are not errors; they are
//! logged and counted where they happen. Everything here aborts the task.

use thiserror::Error;

use crate::core::model::TaskId;

/// Errors raised by the memory / projection engine.
#[derive(Debug, Error)]
pub enum GpmError {
    #[error("SVD did not converge for layer {layer} ({rows}x{cols} representation)")]
    SvdNonConvergence {
        layer: usize,
        rows: usize,
        cols: usize,
    },

    #[error("missing {kind} snapshot for task {task}, layer {layer}")]
    MissingSnapshot {
        kind: &'static str,
        task: TaskId,
        layer: usize,
    },

    #[error("no per-task basis recorded for task {task}, layer {layer}")]
    MissingBasis { task: TaskId, layer: usize },

    #[error("layer count mismatch: expected {expected}, got {actual}")]
    LayerCount { expected: usize, actual: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("distance requested between empty distributions")]
    EmptyDistribution,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("task {task} has an empty split")]
    EmptySplit { task: TaskId },
}

pub type Result<T> = std::result::Result<T, GpmError>;
