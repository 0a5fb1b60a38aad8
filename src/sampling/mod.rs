//! Representation sampling: turning captured layer inputs into the matrices
//! whose column spaces the subspace memory protects.

pub mod patches;
pub mod representation;
