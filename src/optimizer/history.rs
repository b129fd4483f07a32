//! Bookkeeping for architecture search runs
//!
//! Evaluated architectures, the bounded history of the best ones seen,
//! per-architecture metric traces and the serializable checkpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HistoryPolicy;

/// Capacity of the architecture history
pub const HISTORY_CAPACITY: usize = 100;

/// An architecture together with its latest measurement
#[derive(Debug, Clone)]
pub struct EvaluatedArch<S> {
    pub arch: S,
    pub accuracy: f64,
    /// Queried training time, only for time budgets
    pub time: Option<f64>,
    /// Fidelity the measurement was taken at
    pub fidelity: usize,
}

/// Bounded collection of the best architectures seen so far
#[derive(Debug, Clone)]
pub struct ArchitectureHistory<S> {
    entries: Vec<EvaluatedArch<S>>,
    capacity: usize,
    policy: HistoryPolicy,
}

impl<S> ArchitectureHistory<S> {
    pub fn new(capacity: usize, policy: HistoryPolicy) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            policy,
        }
    }

    /// Offer an architecture; returns whether it was kept
    pub fn push(&mut self, child: EvaluatedArch<S>) -> bool {
        if self.entries.len() < self.capacity {
            self.entries.push(child);
            return true;
        }

        let slot = match self.policy {
            HistoryPolicy::FirstMatch => self
                .entries
                .iter()
                .position(|entry| child.accuracy > entry.accuracy),
            HistoryPolicy::TopK => self
                .entries
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.accuracy.total_cmp(&b.1.accuracy))
                .filter(|(_, worst)| child.accuracy > worst.accuracy)
                .map(|(i, _)| i),
        };

        match slot {
            Some(i) => {
                self.entries[i] = child;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[EvaluatedArch<S>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most accurate entry
    pub fn best(&self) -> Option<&EvaluatedArch<S>> {
        self.entries
            .iter()
            .max_by(|a, b| a.accuracy.total_cmp(&b.accuracy))
    }
}

/// Metric traces of one architecture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchStats {
    /// Values per metric name, in evaluation order
    pub metrics: BTreeMap<String, Vec<f64>>,
    /// Fidelity of each evaluation
    pub fidelity: Vec<usize>,
}

/// Append-only measurements keyed by architecture hash
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerStats {
    archs: BTreeMap<u64, ArchStats>,
}

impl OptimizerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, arch_hash: u64, metric: &str, value: f64) {
        self.archs
            .entry(arch_hash)
            .or_default()
            .metrics
            .entry(metric.to_string())
            .or_default()
            .push(value);
    }

    pub fn record_fidelity(&mut self, arch_hash: u64, fidelity: usize) {
        self.archs.entry(arch_hash).or_default().fidelity.push(fidelity);
    }

    pub fn get(&self, arch_hash: u64) -> Option<&ArchStats> {
        self.archs.get(&arch_hash)
    }

    /// Number of distinct architectures seen
    pub fn len(&self) -> usize {
        self.archs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ArchStats)> + '_ {
        self.archs.iter().map(|(&hash, stats)| (hash, stats))
    }
}

/// Serializable view of one history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureRecord<E> {
    pub encoding: E,
    pub accuracy: f64,
    pub time: Option<f64>,
    pub fidelity: usize,
}

/// Checkpoint of a search run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<E> {
    pub saved_at: DateTime<Utc>,
    pub space_name: String,
    pub dataset: String,
    /// Fidelity of the current round
    pub fidelity: usize,
    pub number_archs: usize,
    pub end: bool,
    pub history: Vec<ArchitectureRecord<E>>,
    pub optimizer_stats: OptimizerStats,
}
