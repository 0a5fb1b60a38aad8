//! Constrained optimisation: gradient projection, contrastive alignment,
//! losses and the optimizer.

pub mod contrastive;
pub mod loss;
pub mod optimizer;
pub mod projection;
