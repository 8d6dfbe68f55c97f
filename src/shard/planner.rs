//! Planning strategies.
//!
//! Exactly one strategy is used per instrumentation context:
//!
//! 1. **Custom**: a shard file entry matches the context's binaries and its
//!    groups are used verbatim. Extraction is skipped entirely.
//! 2. **Per-target**: `test_targets_for_shard` is configured. Each entry
//!    becomes one shard of runner clauses.
//! 3. **Computed**: the filtered tests are split by a [`ShardBalancer`].

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::config::{BalancerKind, Config};
use crate::dump::ShardingEntry;
use crate::extract::ExtractedTests;
use crate::filter::{FilterResult, TestFilter, split_shard_targets};

use super::balancer::{CostBalancer, CostEstimator, RoundRobinBalancer, ShardBalancer};
use super::{SchedulableTest, Shard, ShardPlan, normalize_selector};

/// The strategy a context was planned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningStrategy {
    Custom,
    PerTarget,
    Computed,
}

impl fmt::Display for PlanningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanningStrategy::Custom => "custom",
            PlanningStrategy::PerTarget => "per-target",
            PlanningStrategy::Computed => "computed",
        };
        f.write_str(name)
    }
}

/// Plans shards for instrumentation contexts.
pub struct ShardPlanner {
    filter: TestFilter,
    targets_for_shard: Vec<String>,
    always_run: Vec<String>,
    forced_shards: Option<usize>,
    balancer: Box<dyn ShardBalancer>,
}

impl ShardPlanner {
    pub fn new(filter: TestFilter, balancer: Box<dyn ShardBalancer>) -> Self {
        Self {
            filter,
            targets_for_shard: Vec::new(),
            always_run: Vec::new(),
            forced_shards: None,
            balancer,
        }
    }

    /// Builds a planner from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a test target clause is invalid.
    pub fn from_config(config: &Config) -> FilterResult<Self> {
        let run = &config.dexshard;
        let filter = TestFilter::from_test_targets(&run.test_targets, &run.test_targets_for_shard)?;
        let balancer: Box<dyn ShardBalancer> = match run.balancer {
            BalancerKind::Cost => Box::new(CostBalancer::new(
                CostEstimator::from_config(&config.timing),
                run.max_test_shards,
                run.shard_time_secs,
            )),
            BalancerKind::RoundRobin => Box::new(RoundRobinBalancer::new(run.max_test_shards)),
        };
        debug!("Test filter: {filter}");

        Ok(Self::new(filter, balancer)
            .with_targets_for_shard(run.test_targets_for_shard.clone())
            .with_always_run(run.test_targets_always_run.clone())
            .with_forced_shards(run.num_uniform_shards))
    }

    pub fn with_targets_for_shard(mut self, targets: Vec<String>) -> Self {
        self.targets_for_shard = targets;
        self
    }

    /// Selectors prepended to every shard. Bare class names get a `class `
    /// prefix.
    pub fn with_always_run(mut self, targets: Vec<String>) -> Self {
        self.always_run = targets.iter().map(|t| normalize_selector(t)).collect();
        self
    }

    pub fn with_forced_shards(mut self, count: Option<usize>) -> Self {
        self.forced_shards = count;
        self
    }

    /// The strategy used for contexts without a matching shard file entry.
    pub fn strategy(&self) -> PlanningStrategy {
        if self.targets_for_shard.is_empty() {
            PlanningStrategy::Computed
        } else {
            PlanningStrategy::PerTarget
        }
    }

    /// Uses a shard file entry's groups verbatim.
    pub fn plan_custom(entry: &ShardingEntry) -> ShardPlan {
        let shards = entry
            .shards
            .values()
            .map(|selectors| {
                selectors
                    .iter()
                    .map(|s| SchedulableTest::from_selector(s.as_str()))
                    .collect()
            })
            .collect();
        ShardPlan::new(shards, entry.junit_ignored.clone())
    }

    /// Plans extracted tests with the per-target or computed strategy.
    pub fn plan(&self, extracted: &ExtractedTests) -> ShardPlan {
        let tests = extracted.schedulable(&self.filter);
        match self.strategy() {
            PlanningStrategy::PerTarget => self.plan_per_target(&tests),
            _ => self.plan_computed(tests),
        }
    }

    fn plan_per_target(&self, tests: &[SchedulableTest]) -> ShardPlan {
        if tests.is_empty() {
            return ShardPlan::default();
        }
        let shards = self
            .targets_for_shard
            .iter()
            .map(|entry| {
                split_shard_targets(entry)
                    .map(SchedulableTest::from_selector)
                    .collect()
            })
            .collect();
        ShardPlan::new(self.with_always_run_tests(shards), Vec::new())
    }

    fn plan_computed(&self, tests: Vec<SchedulableTest>) -> ShardPlan {
        let (ignored, runnable): (Vec<_>, Vec<_>) = tests.into_iter().partition(|t| t.ignored);
        let ignored_tests = ignored.into_iter().map(|t| t.selector).collect();

        let always_run: HashSet<&str> = self.always_run.iter().map(String::as_str).collect();
        let had_runnable = !runnable.is_empty();
        let runnable: Vec<_> = runnable
            .into_iter()
            .filter(|t| !always_run.contains(t.selector.as_str()))
            .collect();

        let mut shards = self.balancer.balance(runnable, self.forced_shards);
        if shards.is_empty() && had_runnable {
            shards.push(Shard::default());
        }
        debug!(
            "Balanced into {} shard(s) with the {} balancer",
            shards.len(),
            self.balancer.name()
        );

        ShardPlan::new(self.with_always_run_tests(shards), ignored_tests)
    }

    fn with_always_run_tests(&self, shards: Vec<Shard>) -> Vec<Shard> {
        if self.always_run.is_empty() {
            return shards;
        }
        let always_run: HashSet<&str> = self.always_run.iter().map(String::as_str).collect();
        shards
            .into_iter()
            .map(|shard| {
                self.always_run
                    .iter()
                    .map(|s| SchedulableTest::from_selector(s.as_str()))
                    .chain(
                        shard
                            .tests
                            .into_iter()
                            .filter(|t| !always_run.contains(t.selector.as_str())),
                    )
                    .collect()
            })
            .collect()
    }
}
