//! Task data: split containers and a seeded synthetic task generator.

pub mod synthetic;
pub mod task;
