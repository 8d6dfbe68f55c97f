//! The shard file.
//!
//! `dump-shards` writes planned shards to a JSON file instead of running
//! them, and `custom_sharding_file` reads the same format back to override
//! planning:
//!
//! ```json
//! {
//!   "matrix-0": {
//!     "app": "gs://bucket/app.apk",
//!     "test": "gs://bucket/app-test.apk",
//!     "shards": {
//!       "shard-0": ["class com.example.A#t1"],
//!       "shard-1": ["class com.example.B#t1"]
//!     },
//!     "junit-ignored": ["class com.example.A#t2"]
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::context::{BinaryReference, TestContext};

/// Errors reading or writing a shard file.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("Failed to access shard file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid shard file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Shards of one (app, test) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingEntry {
    pub app: String,
    pub test: String,
    #[serde(default)]
    pub shards: IndexMap<String, Vec<String>>,
    #[serde(rename = "junit-ignored", default)]
    pub junit_ignored: Vec<String>,
}

impl ShardingEntry {
    /// Returns `true` if both binaries match by local or remote path.
    pub fn matches(&self, app: &BinaryReference, test: &BinaryReference) -> bool {
        app.matches(&self.app) && test.matches(&self.test)
    }
}

/// A whole shard file, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardingFile {
    pub entries: IndexMap<String, ShardingEntry>,
}

impl ShardingFile {
    pub fn load(path: &Path) -> Result<Self, DumpError> {
        let content = std::fs::read_to_string(path).map_err(|source| DumpError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| DumpError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), DumpError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| DumpError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json + "\n").map_err(|source| DumpError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Collects the planned instrumentation contexts.
    pub fn from_contexts(contexts: &[TestContext]) -> Self {
        let entries = contexts
            .iter()
            .filter_map(TestContext::as_instrumentation)
            .enumerate()
            .map(|(i, ctx)| {
                let shards = ctx
                    .shards
                    .iter()
                    .enumerate()
                    .map(|(j, shard)| (format!("shard-{j}"), shard.selectors()))
                    .collect();
                let entry = ShardingEntry {
                    app: ctx.app.to_string(),
                    test: ctx.test.to_string(),
                    shards,
                    junit_ignored: ctx.ignored_tests.clone(),
                };
                (format!("matrix-{i}"), entry)
            })
            .collect();
        Self { entries }
    }

    /// The first entry matching both binaries.
    pub fn find(&self, app: &BinaryReference, test: &BinaryReference) -> Option<&ShardingEntry> {
        self.entries.values().find(|e| e.matches(app, test))
    }
}
