//! Dense linear-algebra helpers for the subspace memory.
//!
//! Storage stays in `ndarray`; the decomposition itself runs on
//! `nalgebra::DMatrix`. Singular values come back sorted in descending order
//! with `U` columns permuted to match, so callers can slice leading bases.

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Axis};

use crate::config::{SVD_EPS, SVD_MAX_ITER};

/// Thin SVD `A = U·diag(S)·Vᵗ` (only `U` and `S` are kept).
#[derive(Clone, Debug)]
pub struct Svd {
    /// Left singular vectors, `(rows, min(rows, cols))`.
    pub u: Array2<f64>,

    /// Singular values, descending.
    pub singular_values: Array1<f64>,
}

impl Svd {
    /// Sum of squared singular values.
    pub fn total_energy(&self) -> f64 {
        self.singular_values.iter().map(|s| s * s).sum()
    }

    /// First `r` left singular vectors.
    pub fn leading(&self, r: usize) -> Array2<f64> {
        let r = r.min(self.u.ncols());
        self.u.slice(ndarray::s![.., 0..r]).to_owned()
    }
}

/// Thin SVD of `matrix`. Returns `None` when the iteration does not converge.
///
/// Matrices with a zero dimension decompose to an empty spectrum.
pub fn thin_svd(matrix: &Array2<f64>) -> Option<Svd> {
    let (rows, cols) = matrix.dim();
    if rows == 0 || cols == 0 {
        return Some(Svd {
            u: Array2::zeros((rows, 0)),
            singular_values: Array1::zeros(0),
        });
    }

    let dm = DMatrix::from_fn(rows, cols, |i, j| matrix[[i, j]]);
    let svd = dm.try_svd(true, false, SVD_EPS, SVD_MAX_ITER)?;
    let u = svd.u?;
    let values = svd.singular_values;

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let k = order.len();
    let mut u_sorted = Array2::zeros((rows, k));
    let mut s_sorted = Array1::zeros(k);
    for (dst, &src) in order.iter().enumerate() {
        s_sorted[dst] = values[src];
        for i in 0..rows {
            u_sorted[[i, dst]] = u[(i, src)];
        }
    }

    Some(Svd {
        u: u_sorted,
        singular_values: s_sorted,
    })
}

/// Smallest rank whose cumulative energy ratio stays strictly below
/// `threshold`, i.e. `count(cumsum(S²)/ΣS² < τ)`.
///
/// A spectrum with zero total energy has rank 0.
pub fn energy_rank(singular_values: &Array1<f64>, threshold: f64) -> usize {
    let total: f64 = singular_values.iter().map(|s| s * s).sum();
    if total <= 0.0 || !total.is_finite() {
        return 0;
    }
    let mut cumulative = 0.0;
    let mut rank = 0;
    for s in singular_values.iter() {
        cumulative += s * s / total;
        if cumulative < threshold {
            rank += 1;
        }
    }
    rank
}

/// Projector `B·Bᵗ` onto the column space of an orthonormal basis.
pub fn projector(basis: &Array2<f64>) -> Array2<f64> {
    basis.dot(&basis.t())
}

/// Frobenius norm of `BᵗB − I`.
pub fn orthonormality_error(basis: &Array2<f64>) -> f64 {
    let gram = basis.t().dot(basis);
    let mut err = 0.0;
    for ((i, j), v) in gram.indexed_iter() {
        let target = if i == j { 1.0 } else { 0.0 };
        err += (v - target).powi(2);
    }
    err.sqrt()
}

/// Horizontal concatenation `[a | b]`.
pub fn hstack(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    if a.ncols() == 0 {
        return b.clone();
    }
    if b.ncols() == 0 {
        return a.clone();
    }
    ndarray::concatenate(Axis(1), &[a.view(), b.view()])
        .unwrap_or_else(|_| a.clone())
}

/// Narrow an `f64` matrix to `f32`.
pub fn to_f32(m: &Array2<f64>) -> Array2<f32> {
    m.mapv(|v| v as f32)
}

/// Widen an `f32` matrix to `f64`.
pub fn to_f64(m: &Array2<f32>) -> Array2<f64> {
    m.mapv(|v| v as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_svd_sorted_descending() {
        let m = array![[1.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 3.0]];
        let svd = thin_svd(&m).unwrap();
        let s = &svd.singular_values;
        assert!((s[0] - 5.0).abs() < 1e-10);
        assert!((s[1] - 3.0).abs() < 1e-10);
        assert!((s[2] - 1.0).abs() < 1e-10);
        // Leading left vector is ±e1 (row index 1).
        assert!((svd.u[[1, 0]].abs() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_svd_wide_matrix_is_thin() {
        let m = Array2::from_shape_fn((4, 9), |(i, j)| ((i * 7 + j * 3) % 5) as f64);
        let svd = thin_svd(&m).unwrap();
        assert_eq!(svd.u.dim(), (4, 4));
        assert!(orthonormality_error(&svd.u) < 1e-8);
    }

    #[test]
    fn test_svd_empty() {
        let svd = thin_svd(&Array2::zeros((6, 0))).unwrap();
        assert_eq!(svd.u.dim(), (6, 0));
        assert_eq!(svd.total_energy(), 0.0);
    }

    #[test]
    fn test_energy_rank_strict() {
        // Energies 0.5, 0.3, 0.2 -> cumulative 0.5, 0.8, 1.0
        let s = Array1::from_vec(vec![0.5f64.sqrt(), 0.3f64.sqrt(), 0.2f64.sqrt()]);
        assert_eq!(energy_rank(&s, 0.79), 1);
        assert_eq!(energy_rank(&s, 0.81), 2);
        // 1.0 is never strictly below 1.0
        assert_eq!(energy_rank(&s, 1.0), 2);
    }

    #[test]
    fn test_energy_rank_zero_total() {
        let s = Array1::zeros(4);
        assert_eq!(energy_rank(&s, 0.9), 0);
    }

    #[test]
    fn test_projector_idempotent() {
        let b = array![[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        let p = projector(&b);
        let pp = p.dot(&p);
        for (a, c) in p.iter().zip(pp.iter()) {
            assert!((a - c).abs() < 1e-12);
        }
    }

    #[test]
    fn test_hstack_with_empty() {
        let a: Array2<f64> = Array2::zeros((3, 0));
        let b = Array2::ones((3, 2));
        assert_eq!(hstack(&a, &b).dim(), (3, 2));
        assert_eq!(hstack(&b, &b).dim(), (3, 4));
    }
}
