//! Shard balancing.
//!
//! A balancer partitions the runnable tests of one context into shards. The
//! union of the returned shards always equals the input; empty shards may be
//! returned and are discarded by [`ShardPlan`](super::ShardPlan).

use std::collections::HashMap;

use crate::config::TimingConfig;

use super::{SchedulableTest, Shard};

/// Partitions tests into shards.
pub trait ShardBalancer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Splits `tests` into shards. With `forced_count` set, that many shards
    /// are produced, but never more than there are tests.
    fn balance(&self, tests: Vec<SchedulableTest>, forced_count: Option<usize>) -> Vec<Shard>;
}

/// Distributes tests by index, ignoring cost.
pub struct RoundRobinBalancer {
    max_shards: usize,
}

impl RoundRobinBalancer {
    pub fn new(max_shards: usize) -> Self {
        Self {
            max_shards: max_shards.max(1),
        }
    }
}

impl ShardBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn balance(&self, tests: Vec<SchedulableTest>, forced_count: Option<usize>) -> Vec<Shard> {
        if tests.is_empty() {
            return Vec::new();
        }

        let count = forced_count
            .unwrap_or(self.max_shards)
            .clamp(1, tests.len());
        let mut shards: Vec<Shard> = (0..count).map(|_| Shard::default()).collect();
        for (i, test) in tests.into_iter().enumerate() {
            shards[i % count].tests.push(test);
        }
        shards
    }
}

/// Estimates how long a test takes to run.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    known: HashMap<String, f64>,
    default_test_secs: f64,
    default_class_secs: f64,
}

impl CostEstimator {
    pub fn new(
        known: HashMap<String, f64>,
        default_test_secs: f64,
        default_class_secs: f64,
    ) -> Self {
        Self {
            known,
            default_test_secs,
            default_class_secs,
        }
    }

    pub fn from_config(config: &TimingConfig) -> Self {
        Self::new(
            config.tests.clone(),
            config.default_test_time_secs,
            config.default_class_test_time_secs,
        )
    }

    /// Estimated duration in seconds.
    pub fn estimate(&self, test: &SchedulableTest) -> f64 {
        match self.known.get(&test.selector) {
            Some(secs) => *secs,
            None if test.parameterized => self.default_class_secs,
            None => self.default_test_secs,
        }
    }
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default())
    }
}

/// Longest-processing-time-first assignment over estimated costs.
///
/// Tests are taken from most to least expensive and each goes to the shard
/// with the lowest total so far. Within a shard, discovery order is kept.
pub struct CostBalancer {
    estimator: CostEstimator,
    max_shards: usize,
    shard_time_secs: Option<f64>,
}

impl CostBalancer {
    pub fn new(estimator: CostEstimator, max_shards: usize, shard_time_secs: Option<f64>) -> Self {
        Self {
            estimator,
            max_shards: max_shards.max(1),
            shard_time_secs,
        }
    }

    /// Number of shards to use when no count is forced.
    fn shard_count(&self, total_secs: f64, test_count: usize) -> usize {
        let wanted = match self.shard_time_secs {
            Some(target) if target > 0.0 => (total_secs / target).ceil() as usize,
            _ => self.max_shards,
        };
        wanted.clamp(1, self.max_shards).min(test_count.max(1))
    }
}

impl ShardBalancer for CostBalancer {
    fn name(&self) -> &'static str {
        "cost"
    }

    fn balance(&self, tests: Vec<SchedulableTest>, forced_count: Option<usize>) -> Vec<Shard> {
        if tests.is_empty() {
            return Vec::new();
        }

        let costs: Vec<f64> = tests.iter().map(|t| self.estimator.estimate(t)).collect();
        let count = match forced_count {
            Some(count) => count.clamp(1, tests.len()),
            None => self.shard_count(costs.iter().sum(), tests.len()),
        };

        let mut order: Vec<usize> = (0..tests.len()).collect();
        order.sort_by(|&a, &b| costs[b].total_cmp(&costs[a]));

        let mut loads = vec![0.0_f64; count];
        let mut assignment: Vec<Vec<usize>> = vec![Vec::new(); count];
        for index in order {
            let lightest = (0..count)
                .min_by(|&a, &b| loads[a].total_cmp(&loads[b]))
                .unwrap_or(0);
            loads[lightest] += costs[index];
            assignment[lightest].push(index);
        }

        let mut slots: Vec<Option<SchedulableTest>> = tests.into_iter().map(Some).collect();
        assignment
            .into_iter()
            .map(|mut indices| {
                indices.sort_unstable();
                indices
                    .into_iter()
                    .filter_map(|i| slots[i].take())
                    .collect()
            })
            .collect()
    }
}
