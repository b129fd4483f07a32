//! Run configuration
//!
//! Settings for a search run and its optimizer, loadable from JSON.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KolosalError, Result};

/// Resource unit a fidelity is measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetType {
    /// Training epochs, each step costs 1
    Epoch,
    /// Wall-clock training time reported by the benchmark
    Time,
}

impl FromStr for BudgetType {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epoch" => Ok(BudgetType::Epoch),
            "time" => Ok(BudgetType::Time),
            other => Err(KolosalError::ConfigError(format!(
                "budget type should be time or epoch, got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for BudgetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetType::Epoch => write!(f, "epoch"),
            BudgetType::Time => write!(f, "time"),
        }
    }
}

/// How the bounded architecture history admits a new entry once full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Replace the first entry scanned that the challenger beats
    #[default]
    FirstMatch,
    /// Replace the worst entry if the challenger beats it
    TopK,
}

/// Optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Ceiling fidelity
    pub budget_max: usize,
    /// Population size of a bracket
    pub number_archs: usize,
    /// Promotion factor
    pub eta: usize,
    /// Starting fidelity
    pub min_fidelity: usize,
    /// `"epoch"` or `"time"`
    pub budget_type: String,
    pub encoding_type: String,
    pub checkpoint_freq: usize,
    pub epochs: usize,
    pub fidelity: usize,
    pub sample_size: usize,
    pub population_size: usize,
    pub num_init: usize,
    pub k: usize,
    pub num_ensemble: usize,
    pub acq_fn_type: String,
    pub acq_fn_optimization: String,
    pub num_arches_to_mutate: usize,
    pub max_mutations: usize,
    pub num_candidates: usize,
    pub predictor_type: String,
    pub debug_predictor: bool,
    /// Replacement rule of the architecture history
    pub history_policy: HistoryPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            budget_max: 128,
            number_archs: 128,
            eta: 2,
            min_fidelity: 1,
            budget_type: "epoch".to_string(),
            encoding_type: "path".to_string(),
            checkpoint_freq: 5000,
            epochs: 100,
            fidelity: 200,
            sample_size: 10,
            population_size: 30,
            num_init: 10,
            k: 25,
            num_ensemble: 3,
            acq_fn_type: "its".to_string(),
            acq_fn_optimization: "mutation".to_string(),
            num_arches_to_mutate: 2,
            max_mutations: 1,
            num_candidates: 100,
            predictor_type: "feedforward".to_string(),
            debug_predictor: false,
            history_policy: HistoryPolicy::FirstMatch,
        }
    }
}

impl SearchConfig {
    /// Parsed budget type
    pub fn budget_type(&self) -> Result<BudgetType> {
        self.budget_type.parse()
    }

    /// Reject settings the successive-halving schedule cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.eta < 2 {
            return Err(KolosalError::ConfigError(format!("eta must be at least 2, got {}", self.eta)));
        }
        if self.min_fidelity == 0 {
            return Err(KolosalError::ConfigError("min_fidelity must be positive".to_string()));
        }
        if self.number_archs == 0 {
            return Err(KolosalError::ConfigError("number_archs must be positive".to_string()));
        }
        if self.budget_max < self.min_fidelity {
            return Err(KolosalError::ConfigError(format!(
                "budget_max {} is below min_fidelity {}",
                self.budget_max, self.min_fidelity
            )));
        }
        self.budget_type()?;
        Ok(())
    }
}

/// Configuration of a search run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NasConfig {
    /// Random seed
    pub seed: u64,
    pub search_space: String,
    pub dataset: String,
    pub optimizer: String,
    /// Output directory for checkpoints
    pub out_dir: String,
    pub search: SearchConfig,
}

impl Default for NasConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            search_space: "nasbench301".to_string(),
            dataset: "cifar10".to_string(),
            optimizer: "sh".to_string(),
            out_dir: "run".to_string(),
            search: SearchConfig::default(),
        }
    }
}

impl NasConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builder method to set the dataset
    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    /// Builder method to set the output directory
    pub fn with_out_dir(mut self, out_dir: impl Into<String>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    /// Builder method to replace the optimizer settings
    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    /// Builder method to set the successive-halving schedule
    pub fn with_schedule(mut self, number_archs: usize, eta: usize, min_fidelity: usize, budget_max: usize) -> Self {
        self.search.number_archs = number_archs;
        self.search.eta = eta;
        self.search.min_fidelity = min_fidelity;
        self.search.budget_max = budget_max;
        self
    }

    /// Builder method to set the budget type
    pub fn with_budget_type(mut self, budget_type: impl Into<String>) -> Self {
        self.search.budget_type = budget_type.into();
        self
    }

    /// Builder method to set the history policy
    pub fn with_history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.search.history_policy = policy;
        self
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save as pretty-printed JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
