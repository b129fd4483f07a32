//! Kolosal NAS - Neural architecture search toolkit
//!
//! This crate provides the search-space side of neural architecture search:
//! - Nested cell graphs with scoped bulk updates
//! - The NAS-Bench-301 (DARTS) search space with discretization
//! - Compact architecture encodings with sampling and mutation
//! - Multi-fidelity Successive Halving driven by benchmark queries
//!
//! # Modules
//!
//! - [`nas`] - Graphs, primitives, the NAS-Bench-301 space and benchmark queries
//! - [`optimizer`] - Successive Halving, history and checkpoints
//! - [`config`] - Run configuration
//! - [`error`] - Error types

// Core error handling
pub mod error;

pub mod config;
pub mod nas;
pub mod optimizer;

pub use error::{KolosalError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{KolosalError, Result};

    // Configuration
    pub use crate::config::{BudgetType, HistoryPolicy, NasConfig, SearchConfig};

    // Neural architecture search
    pub use crate::nas::{
        Compact, DatasetApi, EdgeData, Genotype, Graph, Metric, NasBench301SearchSpace, QueryableSpace, Scope,
        SurrogateModel,
    };

    // Optimization
    pub use crate::optimizer::{SchedulerState, SuccessiveHalving, TrainStatistics};
}
