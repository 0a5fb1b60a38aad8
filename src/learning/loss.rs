//! Classification losses.

use ndarray::{Array1, Array2};

use crate::config::BCE_LOG_FLOOR;
use crate::error::{GpmError, Result};

/// Mean loss, its gradient w.r.t. the logits, and the number of correct
/// arg-max predictions.
#[derive(Clone, Debug)]
pub struct LossOutput {
    pub loss: f32,
    pub grad: Array2<f32>,
    pub correct: usize,
}

/// Numerically stable softmax of one row.
pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|v| (v - max_val).exp());
    let sum_exp: f32 = exp.sum();
    exp / sum_exp
}

/// Batch-mean softmax cross-entropy against integer labels.
///
/// The gradient is `(softmax(z) − onehot(y)) / batch`.
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<LossOutput> {
    let (n, classes) = logits.dim();
    if n != labels.len() {
        return Err(GpmError::ShapeMismatch(format!(
            "{} logit rows but {} labels",
            n,
            labels.len()
        )));
    }
    if n == 0 {
        return Ok(LossOutput {
            loss: 0.0,
            grad: Array2::zeros((0, classes)),
            correct: 0,
        });
    }

    let mut grad = Array2::zeros((n, classes));
    let mut loss = 0.0f32;
    let mut correct = 0;

    for (i, &y) in labels.iter().enumerate() {
        if y >= classes {
            return Err(GpmError::ShapeMismatch(format!(
                "label {} out of range for {} classes",
                y, classes
            )));
        }
        let row = logits.row(i).to_owned();
        let probs = softmax(&row);
        loss -= probs[y].max(f32::MIN_POSITIVE).ln();

        let predicted = argmax(&row);
        if predicted == y {
            correct += 1;
        }

        let mut g = grad.row_mut(i);
        g.assign(&probs);
        g[y] -= 1.0;
    }

    let scale = 1.0 / n as f32;
    grad.mapv_inplace(|v| v * scale);
    Ok(LossOutput {
        loss: loss * scale,
        grad,
        correct,
    })
}

/// Binary cross-entropy of probability `p` against target `target`, with
/// each log clamped below at -100.
pub fn binary_cross_entropy(p: f64, target: f64) -> f64 {
    let log_p = p.ln().max(BCE_LOG_FLOOR);
    let log_q = (1.0 - p).ln().max(BCE_LOG_FLOOR);
    -(target * log_p + (1.0 - target) * log_q)
}

fn argmax(row: &Array1<f32>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Array2::zeros((2, 4));
        let out = cross_entropy(&logits, &[0, 3]).unwrap();
        assert!((out.loss - (4.0f32).ln()).abs() < 1e-6);
        // Rows of the gradient sum to zero.
        for row in out.grad.rows() {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!((out.grad[[0, 0]] - (0.25 - 1.0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_counts_correct() {
        let logits = array![[2.0, 1.0, 0.1], [0.0, 3.0, 0.0], [5.0, 0.0, 0.0]];
        let out = cross_entropy(&logits, &[0, 1, 2]).unwrap();
        assert_eq!(out.correct, 2);
        assert!(out.loss > 0.0);
    }

    #[test]
    fn test_cross_entropy_rejects_bad_labels() {
        let logits = Array2::zeros((1, 2));
        assert!(cross_entropy(&logits, &[2]).is_err());
        assert!(cross_entropy(&logits, &[0, 1]).is_err());
    }

    #[test]
    fn test_binary_cross_entropy() {
        assert!(binary_cross_entropy(1.0, 1.0).abs() < 1e-12);
        assert!((binary_cross_entropy(0.5, 1.0) - 2f64.ln()).abs() < 1e-12);
        // ln(0) is clamped.
        assert!((binary_cross_entropy(0.0, 1.0) - 100.0).abs() < 1e-12);
    }
}
