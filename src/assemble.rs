//! Context assembly.
//!
//! The assembler plans every instrumentation context concurrently. For each
//! one it either applies a matching custom shard file entry, or materializes
//! the binaries, extracts tests and hands them to the [`ShardPlanner`].
//!
//! The join is fail-fast: the first materialization or extraction failure
//! aborts the whole batch and no partial result is returned. Contexts that
//! end up without shards are dropped with a warning. Robo contexts pass
//! through unchanged.
//!
//! Extraction runs on the blocking pool. When the batch is aborted or
//! cancelled, outstanding extractions stop before their next DEX image.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{BinaryReference, InstrumentationContext, TestContext};
use crate::dex::DexError;
use crate::dump::{DumpError, ShardingFile};
use crate::extract::extract_tests_until;
use crate::filter::FilterError;
use crate::materialize::{self, MaterializeError, Materializer};
use crate::shard::{PlanningStrategy, ShardPlanner};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Failed to materialize {reference}: {source}")]
    Materialize {
        reference: String,
        source: MaterializeError,
    },

    #[error("Failed to read test binary {}: {source}", path.display())]
    Extract { path: PathBuf, source: DexError },

    #[error("Invalid test target: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    ShardingFile(#[from] DumpError),

    #[error("Planning was cancelled")]
    Cancelled,

    #[error("Planning task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Plans test contexts.
pub struct ContextAssembler {
    planner: ShardPlanner,
    materializer: Arc<dyn Materializer>,
    custom_sharding: Option<ShardingFile>,
    cancellation_token: Option<CancellationToken>,
}

impl ContextAssembler {
    pub fn new(planner: ShardPlanner, materializer: Arc<dyn Materializer>) -> Self {
        Self {
            planner,
            materializer,
            custom_sharding: None,
            cancellation_token: None,
        }
    }

    /// Builds an assembler from the configuration, loading the custom shard
    /// file if one is configured.
    pub fn from_config(config: &Config) -> Result<Self, PlanError> {
        let planner = ShardPlanner::from_config(config)?;
        let mut assembler = Self::new(planner, materialize::from_config(&config.materializer));
        if let Some(path) = &config.dexshard.custom_sharding_file {
            let path = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            let file = ShardingFile::load(Path::new(&path))?;
            debug!("Loaded {} custom sharding entries from {path}", file.entries.len());
            assembler = assembler.with_custom_sharding(file);
        }
        Ok(assembler)
    }

    /// Shard file entries that override planning for matching contexts.
    pub fn with_custom_sharding(mut self, file: ShardingFile) -> Self {
        self.custom_sharding = Some(file);
        self
    }

    /// Sets a token that aborts all outstanding work when cancelled.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Plans every context and drops instrumentation contexts without shards.
    ///
    /// # Errors
    ///
    /// Returns the first failure of any context, or [`PlanError::Cancelled`]
    /// if the cancellation token fires first.
    pub async fn assemble(&self, contexts: Vec<TestContext>) -> Result<Vec<TestContext>, PlanError> {
        self.warn_unmatched_custom_entries(&contexts);

        // Fires when this call returns or is dropped.
        let abort = match &self.cancellation_token {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let _abort_on_exit = abort.clone().drop_guard();

        let planned = try_join_all(
            contexts
                .into_iter()
                .map(|ctx| self.plan_context(ctx, &abort)),
        );
        let planned = match &self.cancellation_token {
            Some(token) => select! {
                _ = token.cancelled() => return Err(PlanError::Cancelled),
                result = planned => result?,
            },
            None => planned.await?,
        };

        Ok(planned
            .into_iter()
            .filter(|ctx| match ctx {
                TestContext::Instrumentation(instrumentation) if instrumentation.is_empty() => {
                    warn!("No tests for {}", instrumentation.test.file_name());
                    false
                }
                _ => true,
            })
            .collect())
    }

    async fn plan_context(
        &self,
        context: TestContext,
        abort: &CancellationToken,
    ) -> Result<TestContext, PlanError> {
        match context {
            TestContext::Instrumentation(ctx) => self
                .plan_instrumentation(ctx, abort)
                .await
                .map(TestContext::Instrumentation),
            other => Ok(other),
        }
    }

    async fn plan_instrumentation(
        &self,
        context: InstrumentationContext,
        abort: &CancellationToken,
    ) -> Result<InstrumentationContext, PlanError> {
        let file_name = context.test.file_name();

        if let Some(entry) = self
            .custom_sharding
            .as_ref()
            .and_then(|file| file.find(&context.app, &context.test))
        {
            let plan = ShardPlanner::plan_custom(entry);
            info!(
                "{file_name}: {} shard(s) from custom sharding file",
                plan.shards.len()
            );
            return Ok(context.with_plan(plan, PlanningStrategy::Custom));
        }

        let (app_path, test_path) = tokio::try_join!(
            self.materialize(&context.app),
            self.materialize(&context.test)
        )?;

        let path = test_path.clone();
        let abort = abort.clone();
        let extracted =
            tokio::task::spawn_blocking(move || extract_tests_until(&path, || abort.is_cancelled()))
                .await?
                .map_err(|source| match source {
                    DexError::Cancelled => PlanError::Cancelled,
                    source => PlanError::Extract {
                        path: test_path.clone(),
                        source,
                    },
                })?;

        let strategy = self.planner.strategy();
        let plan = self.planner.plan(&extracted);
        info!(
            "{file_name}: {} test(s) in {} shard(s), {} ignored ({strategy})",
            plan.test_count(),
            plan.shards.len(),
            plan.ignored_tests.len()
        );

        let app = context.app.clone().with_local(app_path);
        let test = context.test.clone().with_local(test_path);
        Ok(context.with_binaries(app, test).with_plan(plan, strategy))
    }

    async fn materialize(&self, reference: &BinaryReference) -> Result<PathBuf, PlanError> {
        self.materializer
            .materialize(reference)
            .await
            .map_err(|source| PlanError::Materialize {
                reference: reference.to_string(),
                source,
            })
    }

    fn warn_unmatched_custom_entries(&self, contexts: &[TestContext]) {
        let Some(file) = &self.custom_sharding else {
            return;
        };
        for (key, entry) in &file.entries {
            let matched = contexts
                .iter()
                .filter_map(TestContext::as_instrumentation)
                .any(|ctx| entry.matches(&ctx.app, &ctx.test));
            if !matched {
                warn!(
                    "Custom sharding entry {key} (app {}, test {}) matches no configured app/test pair",
                    entry.app, entry.test
                );
            }
        }
    }
}
