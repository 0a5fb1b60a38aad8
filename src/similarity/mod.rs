//! Task similarity: distribution distances and the two-sided discriminator.

pub mod discriminator;
pub mod distance;
