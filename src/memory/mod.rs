//! Subspace memory: the per-layer protected bases and the per-task
//! representation snapshots consumed by the task discriminator.

pub mod distribution;
pub mod gpm;
