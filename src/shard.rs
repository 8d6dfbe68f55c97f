//! Shard planning.
//!
//! A shard is a group of tests dispatched together to one device run. Tests
//! are identified by their device-runner selector, the exact string passed as
//! `-e class <selector>` to the instrumentation runner.

pub mod balancer;
pub mod planner;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use balancer::{CostBalancer, CostEstimator, RoundRobinBalancer, ShardBalancer};
pub use planner::{PlanningStrategy, ShardPlanner};

const SELECTOR_PREFIX: &str = "class ";

/// Prefixes a bare class or `Class#method` target with `class `.
///
/// Selectors that already carry a clause kind are returned unchanged.
pub fn normalize_selector(target: &str) -> String {
    let target = target.trim();
    if target.contains(char::is_whitespace) {
        target.to_string()
    } else {
        format!("{SELECTOR_PREFIX}{target}")
    }
}

/// A test ready to be placed into a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedulableTest {
    /// Device-runner selector, `class A#m` or `class A`.
    pub selector: String,

    /// Routed to the ignored list instead of a shard.
    #[serde(default)]
    pub ignored: bool,

    /// The selector names a whole parameterized class.
    #[serde(default)]
    pub parameterized: bool,
}

impl SchedulableTest {
    pub fn method(class_name: &str, method_name: &str, ignored: bool) -> Self {
        Self {
            selector: format!("{SELECTOR_PREFIX}{class_name}#{method_name}"),
            ignored,
            parameterized: false,
        }
    }

    /// The atomic entry for a parameterized class. Never ignored.
    pub fn parameterized_class(class_name: &str) -> Self {
        Self {
            selector: format!("{SELECTOR_PREFIX}{class_name}"),
            ignored: false,
            parameterized: true,
        }
    }

    /// Wraps a selector taken verbatim from a shard file or target list.
    pub fn from_selector(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            ignored: false,
            parameterized: false,
        }
    }
}

impl fmt::Display for SchedulableTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector)
    }
}

/// An ordered group of tests executed in one device run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shard {
    pub tests: Vec<SchedulableTest>,
}

impl Shard {
    pub fn new(tests: Vec<SchedulableTest>) -> Self {
        Self { tests }
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// The selectors in run order.
    pub fn selectors(&self) -> Vec<String> {
        self.tests.iter().map(|t| t.selector.clone()).collect()
    }
}

impl FromIterator<SchedulableTest> for Shard {
    fn from_iter<I: IntoIterator<Item = SchedulableTest>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// The outcome of planning one instrumentation context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPlan {
    pub shards: Vec<Shard>,
    pub ignored_tests: Vec<String>,
}

impl ShardPlan {
    /// Builds a plan, discarding empty shards.
    pub fn new(shards: Vec<Shard>, ignored_tests: Vec<String>) -> Self {
        Self {
            shards: shards.into_iter().filter(|s| !s.is_empty()).collect(),
            ignored_tests,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Number of scheduled selectors across all shards.
    pub fn test_count(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }
}
