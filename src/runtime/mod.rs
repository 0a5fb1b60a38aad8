//! Runtime: the task loop, per-task training, and the final report.

pub mod orchestrator;
pub mod report;
pub mod trainer;
