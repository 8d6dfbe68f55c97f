//! Configuration loading and validation for dexshard.
//!
//! This module provides types and functions for loading dexshard
//! configuration from TOML files or strings.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};

/// Loads and validates dexshard configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The values fail [`validate`]
///
/// # Example
///
/// ```no_run
/// use dexshard::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("dexshard.toml"))?;
/// println!("Max shards: {}", config.dexshard.max_test_shards);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads and validates dexshard configuration from a TOML string.
///
/// # Example
///
/// ```
/// use dexshard::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [dexshard]
///     app = "app.apk"
///     test = "app-test.apk"
///     num_uniform_shards = 2
/// "#)?;
///
/// assert_eq!(config.dexshard.num_uniform_shards, Some(2));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

/// Upper bound for `num_uniform_shards`.
pub const MAX_UNIFORM_SHARDS: usize = 50;

/// Checks value constraints the schema cannot express.
pub fn validate(config: &Config) -> Result<()> {
    let run = &config.dexshard;

    ensure!(run.max_test_shards >= 1, "max_test_shards must be at least 1");
    if let Some(count) = run.num_uniform_shards {
        ensure!(count >= 1, "num_uniform_shards must be at least 1");
        ensure!(
            count <= MAX_UNIFORM_SHARDS,
            "num_uniform_shards must be at most {MAX_UNIFORM_SHARDS}"
        );
        ensure!(
            run.max_test_shards == 1,
            "num_uniform_shards cannot be combined with max_test_shards > 1"
        );
    }
    if let Some(secs) = run.shard_time_secs {
        ensure!(secs > 0.0, "shard_time_secs must be positive");
    }

    if run.app.is_none() {
        if run.test.is_some() || run.robo_script.is_some() {
            bail!("app is required when test or robo_script is set");
        }
        if let Some(pair) = run.additional_app_test_apks.iter().find(|p| p.app.is_none()) {
            bail!(
                "additional_app_test_apks entry for {} needs an app because no main app is set",
                pair.test
            );
        }
        ensure!(
            !run.additional_app_test_apks.is_empty(),
            "no binaries configured: set app or additional_app_test_apks"
        );
    }

    let timing = &config.timing;
    ensure!(
        timing.default_test_time_secs > 0.0 && timing.default_class_test_time_secs > 0.0,
        "default test times must be positive"
    );
    if let Some((selector, _)) = timing.tests.iter().find(|(_, secs)| **secs < 0.0) {
        bail!("timing for {selector} must not be negative");
    }

    Ok(())
}
