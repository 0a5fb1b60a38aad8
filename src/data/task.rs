//! Task and split containers.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::core::model::TaskId;
use crate::error::{GpmError, Result};

/// Inputs `(n, features)` with one integer label per row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Split {
    pub x: Array2<f32>,
    pub y: Vec<usize>,
}

impl Split {
    pub fn new(x: Array2<f32>, y: Vec<usize>) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(GpmError::ShapeMismatch(format!(
                "{} inputs but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Rows `indices` as a mini-batch.
    pub fn batch(&self, indices: &[usize]) -> (Array2<f32>, Vec<usize>) {
        let x = self.x.select(Axis(0), indices);
        let y = indices.iter().map(|&i| self.y[i]).collect();
        (x, y)
    }
}

/// One task of the sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub n_classes: usize,
    pub train: Split,
    pub valid: Split,
    pub test: Split,
}

impl Task {
    /// Fails if any split is empty.
    pub fn validate(&self) -> Result<()> {
        if self.train.is_empty() || self.valid.is_empty() || self.test.is_empty() {
            return Err(GpmError::EmptySplit { task: self.id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_split_batch() {
        let split = Split::new(array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]], vec![0, 1, 2]).unwrap();
        let (x, y) = split.batch(&[2, 0]);
        assert_eq!(x, array![[4.0, 5.0], [0.0, 1.0]]);
        assert_eq!(y, vec![2, 0]);
    }

    #[test]
    fn test_split_length_mismatch() {
        assert!(Split::new(Array2::zeros((2, 3)), vec![0]).is_err());
    }

    #[test]
    fn test_empty_split_rejected() {
        let split = Split::new(Array2::zeros((1, 2)), vec![0]).unwrap();
        let empty = Split::new(Array2::zeros((0, 2)), vec![]).unwrap();
        let task = Task {
            id: 4,
            name: "t4".into(),
            n_classes: 2,
            train: split.clone(),
            valid: empty,
            test: split,
        };
        assert!(matches!(task.validate(), Err(GpmError::EmptySplit { task: 4 })));
    }
}
