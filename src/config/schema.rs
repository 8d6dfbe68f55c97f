//! Configuration schema definitions for dexshard.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig              - Binaries, test targets and sharding options
//! │   └── AppTestPair        - Additional (app, test) binary pairs
//! ├── MaterializerConfig     - How remote binaries are fetched
//! └── TimingConfig           - Cost estimates for the cost balancer
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for dexshard.
///
/// # TOML Structure
///
/// ```toml
/// [dexshard]
/// app = "app-debug.apk"
/// test = "app-debug-androidTest.apk"
/// max_test_shards = 4
///
/// [materializer]
/// download_command = "gsutil cp {remote} {local}"
///
/// [timing]
/// default_test_time_secs = 60.0
/// ```
///
/// # Example
///
/// ```
/// use dexshard::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [dexshard]
///     app = "app.apk"
///     test = "app-test.apk"
/// "#).unwrap();
/// assert_eq!(config.dexshard.max_test_shards, 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Binaries and sharding options.
    pub dexshard: RunConfig,

    /// Binary download settings (optional, has defaults).
    #[serde(default)]
    pub materializer: MaterializerConfig,

    /// Test cost estimates (optional, has defaults).
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Binaries to plan and how to shard them.
///
/// Binary paths starting with `gs://`, `http://` or `https://` are remote and
/// fetched through the materializer; anything else is a local path.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_test_shards` | 1 |
/// | `balancer` | `cost` |
/// | everything else | empty / unset |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// The application under test.
    pub app: Option<String>,

    /// The instrumentation test binary for `app`.
    ///
    /// Without a test binary the app runs as a robo test and is not planned.
    pub test: Option<String>,

    /// Robo script for an app without a test binary.
    pub robo_script: Option<String>,

    /// Further (app, test) pairs planned alongside the main pair.
    #[serde(default)]
    pub additional_app_test_apks: Vec<AppTestPair>,

    /// Test target clauses applied to every pair, e.g.
    /// `notAnnotation com.example.Flaky`.
    #[serde(default)]
    pub test_targets: Vec<String>,

    /// One shard per entry; clauses within an entry are separated by `;`.
    ///
    /// Setting this selects per-target planning.
    #[serde(default)]
    pub test_targets_for_shard: Vec<String>,

    /// Selectors prepended to every shard.
    #[serde(default)]
    pub test_targets_always_run: Vec<String>,

    /// Forces exactly this many shards.
    pub num_uniform_shards: Option<usize>,

    /// Upper bound on the number of computed shards.
    ///
    /// Default: 1
    #[serde(default = "default_max_test_shards")]
    pub max_test_shards: usize,

    /// Target duration of a computed shard in seconds.
    ///
    /// When set, the shard count is the estimated total divided by this
    /// value, capped at `max_test_shards`.
    pub shard_time_secs: Option<f64>,

    /// Balancer used for computed shards.
    #[serde(default)]
    pub balancer: BalancerKind,

    /// Shard file whose entries override planning for matching pairs.
    pub custom_sharding_file: Option<PathBuf>,
}

fn default_max_test_shards() -> usize {
    1
}

/// An additional (app, test) pair. `app` defaults to the main app.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppTestPair {
    pub app: Option<String>,
    pub test: String,
}

/// Balancer for computed shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Longest-processing-time-first over estimated test costs.
    #[default]
    Cost,

    /// Plain distribution by index.
    RoundRobin,
}

/// Settings for fetching remote binaries.
///
/// ```toml
/// [materializer]
/// download_command = "gsutil cp {remote} {local}"
/// cache_dir = "/tmp/dexshard-cache"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaterializerConfig {
    /// Shell command downloading `{remote}` to `{local}`.
    ///
    /// Without it only local binaries can be planned.
    pub download_command: Option<String>,

    /// Directory receiving downloaded binaries.
    ///
    /// Default: `.dexshard/cache`
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".dexshard/cache")
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            download_command: None,
            cache_dir: default_cache_dir(),
        }
    }
}

/// Test cost estimates in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Estimate for a test method without a known timing.
    ///
    /// Default: 120
    #[serde(default = "default_test_time")]
    pub default_test_time_secs: f64,

    /// Estimate for a parameterized class without a known timing.
    ///
    /// Default: 240
    #[serde(default = "default_class_test_time")]
    pub default_class_test_time_secs: f64,

    /// Known timings keyed by selector, e.g. `class com.example.A#t1`.
    #[serde(default)]
    pub tests: HashMap<String, f64>,
}

fn default_test_time() -> f64 {
    120.0
}

fn default_class_test_time() -> f64 {
    240.0
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            default_test_time_secs: default_test_time(),
            default_class_test_time_secs: default_class_test_time(),
            tests: HashMap::new(),
        }
    }
}
