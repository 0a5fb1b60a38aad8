//! Per-task representation snapshots for the task discriminator.
//!
//! Each store is append-only, indexed `[task][layer] -> snapshots`. A
//! snapshot is one representation matrix flattened row-major. Lookups of a
//! (task, layer) pair that was never recorded fail with
//! [`GpmError::MissingSnapshot`].

use std::collections::BTreeMap;

use ndarray::Array2;

use crate::core::model::TaskId;
use crate::error::{GpmError, Result};

/// Snapshot list for one phase ("pre" or "post" training).
#[derive(Clone, Debug)]
pub struct DistributionStore {
    kind: &'static str,
    snapshots: BTreeMap<TaskId, Vec<Vec<Vec<f64>>>>,
}

impl DistributionStore {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            snapshots: BTreeMap::new(),
        }
    }

    /// Store for representations taken before any task-specific training.
    pub fn pre() -> Self {
        Self::new("pre")
    }

    /// Store for representations taken after a task finished training.
    pub fn post() -> Self {
        Self::new("post")
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Append a flattened copy of `representation` for `(task, layer)`.
    pub fn record(&mut self, task: TaskId, layer: usize, representation: &Array2<f64>) {
        let flat: Vec<f64> = representation.iter().copied().collect();
        let layers = self.snapshots.entry(task).or_default();
        if layers.len() <= layer {
            layers.resize_with(layer + 1, Vec::new);
        }
        layers[layer].push(flat);
    }

    /// First snapshot recorded for `(task, layer)`.
    pub fn first(&self, task: TaskId, layer: usize) -> Result<&[f64]> {
        self.snapshots
            .get(&task)
            .and_then(|layers| layers.get(layer))
            .and_then(|snaps| snaps.first())
            .map(|v| v.as_slice())
            .ok_or(GpmError::MissingSnapshot {
                kind: self.kind,
                task,
                layer,
            })
    }

    /// Number of snapshots recorded for `(task, layer)`.
    pub fn count(&self, task: TaskId, layer: usize) -> usize {
        self.snapshots
            .get(&task)
            .and_then(|layers| layers.get(layer))
            .map_or(0, |snaps| snaps.len())
    }

    pub fn contains_task(&self, task: TaskId) -> bool {
        self.snapshots.contains_key(&task)
    }

    pub fn n_tasks(&self) -> usize {
        self.snapshots.len()
    }
}
