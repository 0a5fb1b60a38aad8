//! Core module: linear algebra, the model seam and the reference MLP.

pub mod linalg;
pub mod mlp;
pub mod model;
