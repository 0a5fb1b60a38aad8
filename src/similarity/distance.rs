//! Distribution distances between flattened representation snapshots.
//!
//! Both metrics treat a snapshot as an empirical sample of values:
//! - [`WassersteinDistance`]: 1-D earth mover's distance,
//!   `W₁(u, v) = ∫ |F_u(x) − F_v(x)| dx`, evaluated exactly on the merged
//!   support of the two sorted samples (sample sizes may differ);
//! - [`EuclideanDistance`]: `‖u − v‖₂`, element-wise, equal lengths only.

use serde::{Deserialize, Serialize};

use crate::error::{GpmError, Result};

/// A pluggable distance between two value samples.
pub trait TaskDistance: Send + Sync {
    fn name(&self) -> &'static str;

    fn distance(&self, a: &[f64], b: &[f64]) -> Result<f64>;
}

/// Exact 1-D Wasserstein-1 distance with uniform weights.
#[derive(Clone, Copy, Debug, Default)]
pub struct WassersteinDistance;

impl TaskDistance for WassersteinDistance {
    fn name(&self) -> &'static str {
        "wasserstein"
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> Result<f64> {
        wasserstein_1d(a, b)
    }
}

/// Plain Euclidean norm of the difference.
#[derive(Clone, Copy, Debug, Default)]
pub struct EuclideanDistance;

impl TaskDistance for EuclideanDistance {
    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> Result<f64> {
        if a.is_empty() || b.is_empty() {
            return Err(GpmError::EmptyDistribution);
        }
        if a.len() != b.len() {
            return Err(GpmError::ShapeMismatch(format!(
                "euclidean distance between {} and {} values",
                a.len(),
                b.len()
            )));
        }
        Ok(a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt())
    }
}

/// Selectable distance kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceKind {
    Wasserstein,
    Euclidean,
}

impl DistanceKind {
    pub fn metric(self) -> Box<dyn TaskDistance> {
        match self {
            DistanceKind::Wasserstein => Box::new(WassersteinDistance),
            DistanceKind::Euclidean => Box::new(EuclideanDistance),
        }
    }
}

impl std::str::FromStr for DistanceKind {
    type Err = GpmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wasserstein" | "emd" => Ok(DistanceKind::Wasserstein),
            "euclidean" | "l2" => Ok(DistanceKind::Euclidean),
            other => Err(GpmError::InvalidConfig(format!("unknown distance '{}'", other))),
        }
    }
}

/// `W₁` between the empirical distributions of `u` and `v`.
pub fn wasserstein_1d(u: &[f64], v: &[f64]) -> Result<f64> {
    if u.is_empty() || v.is_empty() {
        return Err(GpmError::EmptyDistribution);
    }
    let mut a = u.to_vec();
    let mut b = v.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let mut support = Vec::with_capacity(a.len() + b.len());
    support.extend_from_slice(&a);
    support.extend_from_slice(&b);
    support.sort_by(f64::total_cmp);

    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (mut ia, mut ib) = (0usize, 0usize);
    let mut total = 0.0;

    for pair in support.windows(2) {
        let x = pair[0];
        while ia < a.len() && a[ia] <= x {
            ia += 1;
        }
        while ib < b.len() && b[ib] <= x {
            ib += 1;
        }
        let gap = pair[1] - x;
        if gap > 0.0 {
            total += (ia as f64 / na - ib as f64 / nb).abs() * gap;
        }
    }
    Ok(total)
}
