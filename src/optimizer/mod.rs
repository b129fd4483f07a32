//! Architecture search optimizers
//!
//! Provides:
//! - Successive Halving over queryable search spaces
//! - Bounded history of the best architectures
//! - Per-architecture metric traces and checkpoints

pub mod history;
mod successive_halving;

pub use history::{
    ArchStats, ArchitectureHistory, ArchitectureRecord, Checkpoint, EvaluatedArch, OptimizerStats, HISTORY_CAPACITY,
};
pub use successive_halving::{SchedulerState, SuccessiveHalving, TrainStatistics};
