//! Benchmark Queries
//!
//! The surface between a search space and the precomputed benchmark or
//! surrogate predictors that stand in for training an architecture.

use std::fmt;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Performance metrics a search space can be queried for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    TrainAccuracy,
    ValAccuracy,
    TestAccuracy,
    TrainLoss,
    TrainTime,
    /// Full raw benchmark record
    Raw,
}

/// DARTS genotype: (operation name, input index) per chosen edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genotype {
    pub normal: Vec<(String, usize)>,
    pub normal_concat: Vec<usize>,
    pub reduce: Vec<(String, usize)>,
    pub reduce_concat: Vec<usize>,
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ops(list: &[(String, usize)]) -> String {
            let items: Vec<String> = list
                .iter()
                .map(|(op, input)| format!("('{}', {})", op, input))
                .collect();
            format!("[{}]", items.join(", "))
        }
        fn concat(list: &[usize]) -> String {
            let items: Vec<String> = list.iter().map(|i| i.to_string()).collect();
            format!("[{}]", items.join(", "))
        }

        write!(
            f,
            "Genotype(normal={}, normal_concat={}, reduce={}, reduce_concat={})",
            ops(&self.normal),
            concat(&self.normal_concat),
            ops(&self.reduce),
            concat(&self.reduce_concat)
        )
    }
}

/// Opaque surrogate predictor supplied by the benchmark
pub trait SurrogateModel: Send + Sync {
    /// Predict a value for the given architecture
    fn predict(&self, genotype: &Genotype) -> Result<f64>;
}

/// Handle to a benchmark's surrogate predictors
pub struct DatasetApi {
    accuracy_model: Box<dyn SurrogateModel>,
    runtime_model: Box<dyn SurrogateModel>,
    /// Only epoch the benchmark can answer for, if it has a single checkpoint
    checkpoint_epoch: Option<usize>,
}

impl DatasetApi {
    /// Create a handle from an accuracy and a runtime predictor
    pub fn new(accuracy_model: Box<dyn SurrogateModel>, runtime_model: Box<dyn SurrogateModel>) -> Self {
        Self {
            accuracy_model,
            runtime_model,
            checkpoint_epoch: None,
        }
    }

    /// Restrict queries to a single checkpoint epoch.
    ///
    /// A benchmark with one checkpoint cannot answer intermediate fidelities:
    /// querying any other epoch trips a debug assertion. Do not combine this
    /// with a multi-fidelity schedule such as successive halving, which
    /// queries at every fidelity from `min_fidelity` upwards.
    pub fn with_checkpoint_epoch(mut self, epoch: usize) -> Self {
        self.checkpoint_epoch = Some(epoch);
        self
    }

    pub fn checkpoint_epoch(&self) -> Option<usize> {
        self.checkpoint_epoch
    }

    /// Whether a query at `epoch` is meaningful for this benchmark
    pub fn supports_epoch(&self, epoch: usize) -> bool {
        self.checkpoint_epoch.map_or(true, |e| e == epoch)
    }

    pub fn accuracy_model(&self) -> &dyn SurrogateModel {
        self.accuracy_model.as_ref()
    }

    pub fn runtime_model(&self) -> &dyn SurrogateModel {
        self.runtime_model.as_ref()
    }
}

impl fmt::Debug for DatasetApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetApi")
            .field("checkpoint_epoch", &self.checkpoint_epoch)
            .finish_non_exhaustive()
    }
}

/// A search space that can be sampled and queried against a benchmark
pub trait QueryableSpace: Clone {
    /// Serializable architecture encoding
    type Encoding: Clone + fmt::Debug + Serialize + DeserializeOwned;

    /// Whether this space can answer benchmark queries
    const QUERYABLE: bool;

    /// Replace the current architecture with a random one
    fn sample_random_architecture<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        dataset_api: Option<&DatasetApi>,
    ) -> Result<()>;

    /// Query a metric of the current architecture
    fn query(
        &self,
        metric: Metric,
        dataset: &str,
        epoch: Option<usize>,
        dataset_api: Option<&DatasetApi>,
    ) -> Result<f64>;

    /// Identity hash of the current architecture
    fn arch_hash(&self) -> Result<u64>;

    /// Encoding of the current architecture
    fn encoding(&self) -> Result<Self::Encoding>;

    fn space_name(&self) -> &str;
}
