//! Accuracy matrix and backward transfer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `acc[i][j]`: test accuracy (%) on task `j` after training task `i`.
///
/// Only the lower triangle (`j ≤ i`) is ever filled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMatrix {
    acc: Vec<Vec<f64>>,
}

impl AccuracyMatrix {
    pub fn new(n_tasks: usize) -> Self {
        Self {
            acc: vec![vec![0.0; n_tasks]; n_tasks],
        }
    }

    pub fn n_tasks(&self) -> usize {
        self.acc.len()
    }

    /// Record the accuracy on `task` measured after training `after`.
    /// Out-of-range or upper-triangle entries are ignored.
    pub fn record(&mut self, after: usize, task: usize, accuracy: f64) {
        if task <= after && after < self.acc.len() {
            self.acc[after][task] = accuracy;
        }
    }

    pub fn get(&self, after: usize, task: usize) -> f64 {
        self.acc
            .get(after)
            .and_then(|row| row.get(task))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn row(&self, after: usize) -> &[f64] {
        self.acc.get(after).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Mean accuracy of the final row.
    pub fn average_accuracy(&self) -> f64 {
        match self.acc.last() {
            Some(last) if !last.is_empty() => last.iter().sum::<f64>() / last.len() as f64,
            _ => 0.0,
        }
    }

    /// Mean of `acc[N−1][i] − acc[i][i]` over `i < N−1`.
    ///
    /// `None` with fewer than two tasks.
    pub fn backward_transfer(&self) -> Option<f64> {
        let n = self.acc.len();
        if n < 2 {
            return None;
        }
        let last = &self.acc[n - 1];
        let sum: f64 = (0..n - 1).map(|i| last[i] - self.acc[i][i]).sum();
        Some(sum / (n - 1) as f64)
    }
}

impl fmt::Display for AccuracyMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.acc.iter().enumerate() {
            for value in &row[..=i] {
                write!(f, "{:6.1}% ", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
