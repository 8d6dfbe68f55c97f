//! dexshard: test discovery and shard planning for Android instrumentation
//! suites.
//!
//! This crate reads compiled Android test binaries, discovers their test
//! methods and splits them into shards for parallel device runs.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Dex**: Decode APKs and DEX images into classes, methods and annotations
//! - **Extract**: Find JUnit3/JUnit4 tests and parameterized classes
//! - **Filter**: Apply include/exclude test target clauses
//! - **Shard**: Plan shards with custom, per-target or computed strategies
//! - **Assemble**: Plan every (app, test) pair concurrently
//! - **Dump**: Read and write the JSON shard file
//!
//! # Example
//!
//! ```no_run
//! use dexshard::assemble::ContextAssembler;
//! use dexshard::config::load_config;
//! use dexshard::context::resolve_contexts;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("dexshard.toml"))?;
//!     let assembler = ContextAssembler::from_config(&config)?;
//!     let contexts = assembler.assemble(resolve_contexts(&config.dexshard)).await?;
//!     println!("Planned {} contexts", contexts.len());
//!     Ok(())
//! }
//! ```

pub mod assemble;
pub mod config;
pub mod context;
pub mod dex;
pub mod dump;
pub mod extract;
pub mod filter;
pub mod materialize;
pub mod shard;

// Re-export commonly used types
pub use assemble::{ContextAssembler, PlanError};
pub use config::{Config, load_config};
pub use context::{BinaryReference, InstrumentationContext, TestContext, resolve_contexts};
pub use extract::{ExtractedTests, extract_tests};
pub use filter::TestFilter;
pub use shard::{SchedulableTest, Shard, ShardPlan, ShardPlanner};
