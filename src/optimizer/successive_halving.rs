//! Successive Halving over a queryable search space
//!
//! Samples a population of architectures, evaluates every member at the
//! current fidelity, keeps the best `1/eta` of them and multiplies the
//! fidelity by `eta` until the budget ceiling is passed.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::history::{
    ArchitectureHistory, ArchitectureRecord, Checkpoint, EvaluatedArch, OptimizerStats, HISTORY_CAPACITY,
};
use crate::config::{BudgetType, NasConfig};
use crate::error::{KolosalError, Result};
use crate::nas::{DatasetApi, Metric, NasBench301SearchSpace, QueryableSpace};

const NUM_STATS: usize = 4;

/// Metrics recorded for every evaluation
const STATS_METRICS: [(&str, Metric); NUM_STATS] = [
    ("train_acc", Metric::TrainAccuracy),
    ("val_acc", Metric::ValAccuracy),
    ("test_acc", Metric::TestAccuracy),
    ("train_time", Metric::TrainTime),
];

/// Phase of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Filling the population with fresh architectures
    Sampling,
    /// Re-evaluating survivors at the current fidelity
    Evaluating,
    /// Sorting a completed round
    Ranking,
    /// Survivors kept, next round pending
    Promoting,
    /// No further steps
    Terminated,
}

/// Statistics of one architecture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainStatistics {
    pub train_accuracy: f64,
    pub valid_accuracy: f64,
    pub test_accuracy: f64,
    pub train_time: f64,
}

/// Successive Halving optimizer
pub struct SuccessiveHalving<S: QueryableSpace = NasBench301SearchSpace> {
    budget_max: usize,
    number_archs: usize,
    eta: usize,
    fidelity: usize,
    budget_type: BudgetType,
    dataset: String,
    performance_metric: Metric,
    /// Position of the next evaluation within the round
    fidelity_counter: usize,
    search_space: Option<S>,
    dataset_api: Option<Arc<DatasetApi>>,
    sampled_archs: Vec<EvaluatedArch<S>>,
    last_evaluated: Option<S>,
    history: ArchitectureHistory<S>,
    optimizer_stats: OptimizerStats,
    state: SchedulerState,
    end: bool,
    rng: Xoshiro256PlusPlus,
}

impl<S: QueryableSpace> SuccessiveHalving<S> {
    /// Create a new optimizer from a validated configuration
    pub fn new(config: &NasConfig) -> Result<Self> {
        let search = &config.search;
        search.validate()?;

        Ok(Self {
            budget_max: search.budget_max,
            number_archs: search.number_archs,
            eta: search.eta,
            fidelity: search.min_fidelity,
            budget_type: search.budget_type()?,
            dataset: config.dataset.clone(),
            performance_metric: Metric::ValAccuracy,
            fidelity_counter: 0,
            search_space: None,
            dataset_api: None,
            sampled_archs: Vec::with_capacity(search.number_archs),
            last_evaluated: None,
            history: ArchitectureHistory::new(HISTORY_CAPACITY, search.history_policy),
            optimizer_stats: OptimizerStats::new(),
            state: SchedulerState::Sampling,
            end: false,
            rng: Xoshiro256PlusPlus::seed_from_u64(config.seed),
        })
    }

    /// Attach the search space to sample from and the benchmark to query
    pub fn adapt_search_space(&mut self, search_space: &S, dataset_api: Option<Arc<DatasetApi>>) -> Result<()> {
        if !S::QUERYABLE {
            return Err(KolosalError::ConfigError(format!(
                "successive halving is only implemented for benchmarks, {} is not queryable",
                search_space.space_name()
            )));
        }
        self.search_space = Some(search_space.clone());
        self.dataset_api = dataset_api;
        Ok(())
    }

    /// Evaluate one architecture; returns the resource it consumed
    pub fn new_epoch(&mut self) -> Result<f64> {
        if self.end {
            return Err(KolosalError::OptimizationError(
                "successive halving has already terminated".to_string(),
            ));
        }
        let space = self.search_space.as_ref().ok_or_else(|| {
            KolosalError::ConfigError("adapt_search_space must be called before new_epoch".to_string())
        })?;

        let position = self.fidelity_counter;
        let entry = if self.sampled_archs.len() < self.number_archs {
            self.state = SchedulerState::Sampling;
            let mut arch = space.clone();
            arch.sample_random_architecture(&mut self.rng, self.dataset_api.as_deref())?;
            let (accuracy, time) = self.evaluate(&arch)?;
            EvaluatedArch {
                arch,
                accuracy,
                time,
                fidelity: self.fidelity,
            }
        } else {
            self.state = SchedulerState::Evaluating;
            let arch = self.sampled_archs[position].arch.clone();
            let (accuracy, time) = self.evaluate(&arch)?;
            EvaluatedArch {
                arch,
                accuracy,
                time,
                fidelity: self.fidelity,
            }
        };
        // every query runs before the scheduler state changes
        let (arch_hash, metrics) = self.query_stats(&entry.arch)?;

        let budget = entry.time.unwrap_or(1.0);
        debug!(
            position,
            fidelity = self.fidelity,
            accuracy = entry.accuracy,
            "Evaluated architecture"
        );

        self.update_optimizer_stats(arch_hash, metrics);
        self.history.push(entry.clone());
        self.last_evaluated = Some(entry.arch.clone());
        if position < self.sampled_archs.len() {
            self.sampled_archs[position] = entry;
        } else {
            self.sampled_archs.push(entry);
        }
        self.fidelity_counter += 1;

        if self.fidelity_counter == self.number_archs {
            self.rank_and_promote();
        }
        Ok(budget)
    }

    fn evaluate(&self, arch: &S) -> Result<(f64, Option<f64>)> {
        let api = self.dataset_api.as_deref();
        let epoch = Some(self.fidelity);
        let accuracy = arch.query(self.performance_metric, &self.dataset, epoch, api)?;
        let time = match self.budget_type {
            BudgetType::Time => Some(arch.query(Metric::TrainTime, &self.dataset, epoch, api)?),
            BudgetType::Epoch => None,
        };
        Ok((accuracy, time))
    }

    fn query_stats(&self, arch: &S) -> Result<(u64, [f64; NUM_STATS])> {
        let api = self.dataset_api.as_deref();
        let mut values = [0.0; NUM_STATS];
        for (value, (_, metric)) in values.iter_mut().zip(STATS_METRICS) {
            *value = arch.query(metric, &self.dataset, Some(self.fidelity), api)?;
        }
        Ok((arch.arch_hash()?, values))
    }

    fn update_optimizer_stats(&mut self, arch_hash: u64, values: [f64; NUM_STATS]) {
        for ((name, _), value) in STATS_METRICS.into_iter().zip(values) {
            self.optimizer_stats.record(arch_hash, name, value);
        }
        self.optimizer_stats.record_fidelity(arch_hash, self.fidelity);
    }

    fn rank_and_promote(&mut self) {
        self.state = SchedulerState::Ranking;
        let previous = self.number_archs;

        // an overflowing fidelity is past any budget
        let next_fidelity = self.fidelity.checked_mul(self.eta);
        self.fidelity = next_fidelity.unwrap_or(usize::MAX);
        self.sampled_archs
            .sort_by(|a, b| b.accuracy.total_cmp(&a.accuracy));

        let survivors = self.number_archs / self.eta;
        if next_fidelity.map_or(true, |f| f > self.budget_max) {
            self.end = true;
        } else if survivors > 0 {
            self.sampled_archs.truncate(survivors);
            self.state = SchedulerState::Promoting;
        } else {
            self.sampled_archs.truncate(1);
            self.end = true;
        }
        self.number_archs = self.sampled_archs.len();
        self.fidelity_counter = 0;

        if self.end {
            self.state = SchedulerState::Terminated;
            info!(
                population = self.number_archs,
                fidelity = self.fidelity,
                best_accuracy = ?self.sampled_archs.first().map(|e| e.accuracy),
                "Successive halving terminated"
            );
        } else {
            info!(
                previous,
                population = self.number_archs,
                next_fidelity = self.fidelity,
                "Promoted architectures"
            );
        }
    }

    /// Most accurate architecture of the active population
    pub fn get_final_architecture(&self) -> Option<&S> {
        self.sampled_archs
            .iter()
            .reduce(|best, e| if e.accuracy > best.accuracy { e } else { best })
            .map(|e| &e.arch)
    }

    /// Statistics of the incumbent or of the last evaluated architecture
    pub fn train_statistics(&self, report_incumbent: bool) -> Result<TrainStatistics> {
        let arch = if report_incumbent {
            self.get_final_architecture()
        } else {
            self.last_evaluated.as_ref()
        }
        .ok_or_else(|| KolosalError::OptimizationError("no architecture has been evaluated yet".to_string()))?;

        let api = self.dataset_api.as_deref();
        let query = |metric| arch.query(metric, &self.dataset, None, api);
        Ok(TrainStatistics {
            train_accuracy: query(Metric::TrainAccuracy)?,
            valid_accuracy: query(Metric::ValAccuracy)?,
            test_accuracy: query(Metric::TestAccuracy)?,
            train_time: query(Metric::TrainTime)?,
        })
    }

    /// Raw benchmark record of the incumbent
    pub fn test_statistics(&self) -> Result<f64> {
        let arch = self
            .get_final_architecture()
            .ok_or_else(|| KolosalError::OptimizationError("no architecture has been evaluated yet".to_string()))?;
        arch.query(Metric::Raw, &self.dataset, None, self.dataset_api.as_deref())
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.end
    }

    pub fn get_end(&self) -> bool {
        self.end
    }

    /// Fidelity of the current round
    pub fn fidelity(&self) -> usize {
        self.fidelity
    }

    /// Population size of the current round
    pub fn number_archs(&self) -> usize {
        self.number_archs
    }

    pub fn population(&self) -> &[EvaluatedArch<S>] {
        &self.sampled_archs
    }

    pub fn history(&self) -> &ArchitectureHistory<S> {
        &self.history
    }

    pub fn optimizer_stats(&self) -> &OptimizerStats {
        &self.optimizer_stats
    }

    pub fn search_space(&self) -> Option<&S> {
        self.search_space.as_ref()
    }

    /// Serializable snapshot of the run
    pub fn get_checkpointables(&self) -> Result<Checkpoint<S::Encoding>> {
        let history = self
            .history
            .entries()
            .iter()
            .map(|e| {
                Ok(ArchitectureRecord {
                    encoding: e.arch.encoding()?,
                    accuracy: e.accuracy,
                    time: e.time,
                    fidelity: e.fidelity,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Checkpoint {
            saved_at: chrono::Utc::now(),
            space_name: self
                .search_space
                .as_ref()
                .map(|s| s.space_name().to_string())
                .unwrap_or_default(),
            dataset: self.dataset.clone(),
            fidelity: self.fidelity,
            number_archs: self.number_archs,
            end: self.end,
            history,
            optimizer_stats: self.optimizer_stats.clone(),
        })
    }

    /// Save the checkpoint as JSON
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.get_checkpointables()?)?;
        fs::write(path, json)?;
        info!(path = %path.display(), entries = self.history.len(), "Saved checkpoint");
        Ok(())
    }

    /// Load a checkpoint written by [`SuccessiveHalving::save_checkpoint`]
    pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint<S::Encoding>> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let checkpoint: Checkpoint<S::Encoding> = serde_json::from_str(&json)?;
        info!(path = %path.display(), entries = checkpoint.history.len(), "Loaded checkpoint");
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryPolicy;
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Space whose architectures are a single score
    #[derive(Debug, Clone)]
    struct ScoreSpace {
        score: f64,
    }

    impl QueryableSpace for ScoreSpace {
        type Encoding = f64;

        const QUERYABLE: bool = true;

        fn sample_random_architecture<R: Rng + ?Sized>(
            &mut self,
            rng: &mut R,
            _dataset_api: Option<&DatasetApi>,
        ) -> Result<()> {
            self.score = rng.gen_range(0.0..100.0);
            Ok(())
        }

        fn query(&self, metric: Metric, _dataset: &str, _epoch: Option<usize>, _api: Option<&DatasetApi>) -> Result<f64> {
            Ok(match metric {
                Metric::ValAccuracy => self.score,
                Metric::TrainAccuracy => self.score + 1.0,
                Metric::TestAccuracy => self.score - 1.0,
                Metric::TrainTime => 42.0,
                _ => -1.0,
            })
        }

        fn arch_hash(&self) -> Result<u64> {
            Ok(self.score.to_bits())
        }

        fn encoding(&self) -> Result<f64> {
            Ok(self.score)
        }

        fn space_name(&self) -> &str {
            "score"
        }
    }

    #[derive(Debug, Clone)]
    struct OfflineSpace;

    impl QueryableSpace for OfflineSpace {
        type Encoding = ();

        const QUERYABLE: bool = false;

        fn sample_random_architecture<R: Rng + ?Sized>(&mut self, _rng: &mut R, _api: Option<&DatasetApi>) -> Result<()> {
            Ok(())
        }

        fn query(&self, _metric: Metric, _dataset: &str, _epoch: Option<usize>, _api: Option<&DatasetApi>) -> Result<f64> {
            Ok(-1.0)
        }

        fn arch_hash(&self) -> Result<u64> {
            Ok(0)
        }

        fn encoding(&self) -> Result<()> {
            Ok(())
        }

        fn space_name(&self) -> &str {
            "offline"
        }
    }

    /// Score space whose statistics queries fail while `broken` is set
    #[derive(Debug, Clone)]
    struct FlakySpace {
        inner: ScoreSpace,
        broken: Arc<AtomicBool>,
    }

    impl QueryableSpace for FlakySpace {
        type Encoding = f64;

        const QUERYABLE: bool = true;

        fn sample_random_architecture<R: Rng + ?Sized>(&mut self, rng: &mut R, api: Option<&DatasetApi>) -> Result<()> {
            self.inner.sample_random_architecture(rng, api)
        }

        fn query(&self, metric: Metric, dataset: &str, epoch: Option<usize>, api: Option<&DatasetApi>) -> Result<f64> {
            if metric == Metric::TrainAccuracy && self.broken.load(Ordering::SeqCst) {
                return Err(KolosalError::OptimizationError("benchmark unavailable".to_string()));
            }
            self.inner.query(metric, dataset, epoch, api)
        }

        fn arch_hash(&self) -> Result<u64> {
            self.inner.arch_hash()
        }

        fn encoding(&self) -> Result<f64> {
            self.inner.encoding()
        }

        fn space_name(&self) -> &str {
            "flaky"
        }
    }

    fn optimizer(config: &NasConfig) -> SuccessiveHalving<ScoreSpace> {
        let mut sh = SuccessiveHalving::new(config).unwrap();
        sh.adapt_search_space(&ScoreSpace { score: 0.0 }, None).unwrap();
        sh
    }

    #[test]
    fn test_halving_schedule() {
        let config = NasConfig::new().with_seed(42).with_schedule(8, 2, 1, 8);
        let mut sh = optimizer(&config);

        let mut rounds = Vec::new();
        let mut steps = 0;
        while !sh.is_terminated() {
            let before = sh.number_archs();
            assert_eq!(sh.new_epoch().unwrap(), 1.0);
            steps += 1;
            if sh.number_archs() != before || sh.is_terminated() {
                rounds.push((sh.number_archs(), sh.fidelity()));
            }
        }

        assert_eq!(steps, 15);
        assert_eq!(rounds, vec![(4, 2), (2, 4), (1, 8), (1, 16)]);
        assert_eq!(sh.state(), SchedulerState::Terminated);
        assert!(sh.get_end());

        let best_seen = sh.history().best().unwrap().arch.score;
        assert_eq!(sh.get_final_architecture().unwrap().score, best_seen);
    }

    #[test]
    fn test_step_after_termination_fails() {
        let config = NasConfig::new().with_schedule(1, 2, 1, 100);
        let mut sh = optimizer(&config);
        sh.new_epoch().unwrap();

        // a single survivor cannot be halved again
        assert!(sh.is_terminated());
        assert_eq!(sh.population().len(), 1);
        let err = sh.new_epoch().unwrap_err();
        assert!(matches!(err, KolosalError::OptimizationError(_)));
    }

    #[test]
    fn test_states() {
        let config = NasConfig::new().with_schedule(4, 2, 1, 64);
        let mut sh = optimizer(&config);
        assert_eq!(sh.state(), SchedulerState::Sampling);

        for _ in 0..3 {
            sh.new_epoch().unwrap();
            assert_eq!(sh.state(), SchedulerState::Sampling);
        }
        sh.new_epoch().unwrap();
        assert_eq!(sh.state(), SchedulerState::Promoting);

        sh.new_epoch().unwrap();
        assert_eq!(sh.state(), SchedulerState::Evaluating);
    }

    #[test]
    fn test_time_budget_cost() {
        let config = NasConfig::new().with_schedule(4, 2, 1, 8).with_budget_type("time");
        let mut sh = optimizer(&config);
        assert_eq!(sh.new_epoch().unwrap(), 42.0);
        assert_eq!(sh.population()[0].time, Some(42.0));
    }

    #[test]
    fn test_invalid_budget_type() {
        let config = NasConfig::new().with_budget_type("flops");
        let err = SuccessiveHalving::<ScoreSpace>::new(&config).err().unwrap();
        assert!(matches!(err, KolosalError::ConfigError(_)));
    }

    #[test]
    fn test_requires_search_space() {
        let mut sh = SuccessiveHalving::<ScoreSpace>::new(&NasConfig::default()).unwrap();
        assert!(matches!(sh.new_epoch(), Err(KolosalError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_unqueryable_space() {
        let mut sh = SuccessiveHalving::<OfflineSpace>::new(&NasConfig::default()).unwrap();
        let err = sh.adapt_search_space(&OfflineSpace, None).unwrap_err();
        assert!(matches!(err, KolosalError::ConfigError(_)));
    }

    #[test]
    fn test_optimizer_stats() {
        let config = NasConfig::new().with_schedule(4, 2, 1, 8);
        let mut sh = optimizer(&config);
        for _ in 0..6 {
            sh.new_epoch().unwrap();
        }

        let stats = sh.optimizer_stats();
        assert_eq!(stats.len(), 4);
        let survivor = sh.population()[0].arch.arch_hash().unwrap();
        let trace = stats.get(survivor).unwrap();
        assert_eq!(trace.fidelity, vec![1, 2]);
        assert_eq!(trace.metrics["train_time"], vec![42.0, 42.0]);
    }

    #[test]
    fn test_train_statistics() {
        let config = NasConfig::new().with_schedule(4, 2, 1, 8);
        let mut sh = optimizer(&config);
        assert!(sh.train_statistics(true).is_err());

        for _ in 0..3 {
            sh.new_epoch().unwrap();
        }
        let best = sh.get_final_architecture().unwrap().score;
        let stats = sh.train_statistics(true).unwrap();
        assert_eq!(stats.valid_accuracy, best);
        assert_eq!(stats.train_accuracy, best + 1.0);
        assert_eq!(stats.train_time, 42.0);

        let last = sh.population().last().unwrap().arch.score;
        assert_eq!(sh.train_statistics(false).unwrap().test_accuracy, last - 1.0);
        assert_eq!(sh.test_statistics().unwrap(), -1.0);
    }

    #[test]
    fn test_last_evaluated_survives_ranking() {
        let config = NasConfig::new().with_seed(42).with_schedule(4, 2, 1, 64);
        let mut sh = optimizer(&config);
        for _ in 0..4 {
            sh.new_epoch().unwrap();
        }

        // population is sorted now, the fourth sample is still the last one evaluated
        let fourth = sh.history().entries()[3].arch.score;
        assert_eq!(sh.train_statistics(false).unwrap().valid_accuracy, fourth);

        sh.new_epoch().unwrap();
        let reevaluated = sh.population()[0].arch.score;
        assert_ne!(reevaluated, sh.population()[1].arch.score);
        assert_eq!(sh.train_statistics(false).unwrap().valid_accuracy, reevaluated);
    }

    #[test]
    fn test_fidelity_overflow_terminates() {
        let config = NasConfig::new().with_schedule(2, 2, usize::MAX / 2 + 1, usize::MAX);
        let mut sh = optimizer(&config);
        sh.new_epoch().unwrap();
        sh.new_epoch().unwrap();

        assert!(sh.is_terminated());
        assert_eq!(sh.fidelity(), usize::MAX);
        assert_eq!(sh.population().len(), 2);
    }

    #[test]
    fn test_failed_step_leaves_state_untouched() {
        let broken = Arc::new(AtomicBool::new(true));
        let space = FlakySpace {
            inner: ScoreSpace { score: 0.0 },
            broken: Arc::clone(&broken),
        };
        let config = NasConfig::new().with_schedule(4, 2, 1, 8);
        let mut sh = SuccessiveHalving::new(&config).unwrap();
        sh.adapt_search_space(&space, None).unwrap();

        assert!(sh.new_epoch().is_err());
        assert!(sh.population().is_empty());
        assert!(sh.history().is_empty());
        assert!(sh.optimizer_stats().is_empty());

        broken.store(false, Ordering::SeqCst);
        for _ in 0..4 {
            sh.new_epoch().unwrap();
        }
        assert_eq!(sh.state(), SchedulerState::Promoting);
        assert_eq!(sh.population().len(), 2);
        assert_eq!(sh.optimizer_stats().len(), 4);
    }

    #[test]
    fn test_seed_reproducible() {
        let config = NasConfig::new().with_seed(11).with_schedule(8, 2, 1, 4);
        let run = || {
            let mut sh = optimizer(&config);
            while !sh.is_terminated() {
                sh.new_epoch().unwrap();
            }
            sh.get_final_architecture().unwrap().score
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_top_k_history() {
        let config = NasConfig::new()
            .with_schedule(8, 2, 1, 8)
            .with_history_policy(HistoryPolicy::TopK);
        let mut sh = optimizer(&config);
        sh.new_epoch().unwrap();
        assert_eq!(sh.history().len(), 1);
        assert_eq!(sh.history().capacity(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let config = NasConfig::new().with_schedule(4, 2, 1, 8);
        let mut sh = optimizer(&config);
        for _ in 0..4 {
            sh.new_epoch().unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        sh.save_checkpoint(&path).unwrap();

        let checkpoint = SuccessiveHalving::<ScoreSpace>::load_checkpoint(&path).unwrap();
        assert_eq!(checkpoint.space_name, "score");
        assert_eq!(checkpoint.fidelity, 2);
        assert_eq!(checkpoint.number_archs, 2);
        assert_eq!(checkpoint.history.len(), 4);
        let saved = sh.history().entries()[0].arch.score;
        assert!((checkpoint.history[0].encoding - saved).abs() < 1e-9);
    }
}
