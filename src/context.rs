//! Test execution contexts.
//!
//! A context is one device matrix: an app, optionally a test binary, and for
//! instrumentation contexts the planned shards. Contexts are updated by
//! replacement, never in place.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::RunConfig;
use crate::shard::{PlanningStrategy, Shard, ShardPlan};

const REMOTE_PREFIXES: [&str; 3] = ["gs://", "http://", "https://"];

/// A binary identified by a local path, a remote path, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BinaryReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl BinaryReference {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            local: Some(path.into()),
            remote: None,
        }
    }

    pub fn remote(uri: impl Into<String>) -> Self {
        Self {
            local: None,
            remote: Some(uri.into()),
        }
    }

    /// Classifies a configured path. `~` in local paths is expanded.
    pub fn parse(path: &str) -> Self {
        if REMOTE_PREFIXES.iter().any(|p| path.starts_with(p)) {
            Self::remote(path)
        } else {
            Self::local(shellexpand::tilde(path).into_owned())
        }
    }

    /// Records where the binary was materialized, keeping the remote path.
    pub fn with_local(self, path: impl Into<PathBuf>) -> Self {
        Self {
            local: Some(path.into()),
            ..self
        }
    }

    /// Returns `true` if `path` names this binary, by local or remote path.
    pub fn matches(&self, path: &str) -> bool {
        let other = Self::parse(path);
        (self.local.is_some() && self.local == other.local)
            || (self.remote.is_some() && self.remote == other.remote)
    }

    /// Last path component, used in diagnostics.
    pub fn file_name(&self) -> String {
        let from_local = self
            .local
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned());
        let from_remote = || {
            self.remote
                .as_deref()
                .and_then(|r| r.rsplit('/').find(|s| !s.is_empty()))
                .map(str::to_string)
        };
        from_local.or_else(from_remote).unwrap_or_default()
    }
}

impl fmt::Display for BinaryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.remote, &self.local) {
            (Some(remote), _) => f.write_str(remote),
            (None, Some(local)) => write!(f, "{}", local.display()),
            (None, None) => f.write_str("<none>"),
        }
    }
}

/// An instrumentation test matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentationContext {
    pub app: BinaryReference,
    pub test: BinaryReference,
    pub shards: Vec<Shard>,
    pub ignored_tests: Vec<String>,
    #[serde(skip)]
    pub strategy: Option<PlanningStrategy>,
}

impl InstrumentationContext {
    pub fn new(app: BinaryReference, test: BinaryReference) -> Self {
        Self {
            app,
            test,
            shards: Vec::new(),
            ignored_tests: Vec::new(),
            strategy: None,
        }
    }

    pub fn with_binaries(self, app: BinaryReference, test: BinaryReference) -> Self {
        Self { app, test, ..self }
    }

    pub fn with_plan(self, plan: ShardPlan, strategy: PlanningStrategy) -> Self {
        Self {
            shards: plan.shards,
            ignored_tests: plan.ignored_tests,
            strategy: Some(strategy),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// A robo crawl of an app, optionally scripted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoboContext {
    pub app: BinaryReference,
    pub robo_script: BinaryReference,
}

/// A robo crawl without a script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanityRoboContext {
    pub app: BinaryReference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TestContext {
    Instrumentation(InstrumentationContext),
    Robo(RoboContext),
    SanityRobo(SanityRoboContext),
}

impl TestContext {
    pub fn as_instrumentation(&self) -> Option<&InstrumentationContext> {
        match self {
            TestContext::Instrumentation(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// Builds the unplanned contexts described by the configuration.
///
/// The main app yields an instrumentation context when a test binary is set,
/// a robo context when a robo script is set, and a sanity robo context
/// otherwise. Each additional pair yields an instrumentation context whose
/// app defaults to the main app.
pub fn resolve_contexts(config: &RunConfig) -> Vec<TestContext> {
    let mut contexts = Vec::new();

    if let Some(app) = config.app.as_deref() {
        let app_ref = BinaryReference::parse(app);
        let context = match (&config.test, &config.robo_script) {
            (Some(test), _) => TestContext::Instrumentation(InstrumentationContext::new(
                app_ref,
                BinaryReference::parse(test),
            )),
            (None, Some(script)) => TestContext::Robo(RoboContext {
                app: app_ref,
                robo_script: BinaryReference::parse(script),
            }),
            (None, None) => TestContext::SanityRobo(SanityRoboContext { app: app_ref }),
        };
        contexts.push(context);
    }

    for pair in &config.additional_app_test_apks {
        let Some(app) = pair.app.as_deref().or(config.app.as_deref()) else {
            continue;
        };
        contexts.push(TestContext::Instrumentation(InstrumentationContext::new(
            BinaryReference::parse(app),
            BinaryReference::parse(&pair.test),
        )));
    }

    contexts
}
