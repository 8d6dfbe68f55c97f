//! dexshard CLI - Android instrumentation test shard planner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dexshard::config;
use dexshard::context::{TestContext, resolve_contexts};
use dexshard::dump::ShardingFile;
use dexshard::extract::extract_tests;
use dexshard::filter::TestFilter;
use dexshard::shard::ShardPlanner;
use dexshard::ContextAssembler;

#[derive(Parser)]
#[command(name = "dexshard")]
#[command(about = "Test discovery and shard planning for Android instrumentation suites", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dexshard.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan shards for every configured app/test pair
    Plan {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Plan shards and write them to a shard file
    DumpShards {
        /// Shard file path
        #[arg(short, long, default_value = "android_shards.json")]
        output: PathBuf,
    },

    /// List the tests in a test binary
    List {
        /// APK or DEX file to read
        binary: PathBuf,

        /// Test target clause, e.g. "package com.example" (repeatable)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG overrides --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Plan { format } => plan(&cli.config, &format).await,
        Commands::DumpShards { output } => dump_shards(&cli.config, &output).await,
        Commands::List {
            binary,
            targets,
            format,
        } => list_tests(binary, &targets, &format).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

/// Loads the configuration and plans every context, cancelling on Ctrl-C.
async fn plan_contexts(config_path: &Path) -> Result<Vec<TestContext>> {
    let config = config::load_config(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling planning");
            ctrl_c_token.cancel();
        }
    });

    let assembler = ContextAssembler::from_config(&config)?.with_cancellation_token(token);
    let contexts = assembler
        .assemble(resolve_contexts(&config.dexshard))
        .await
        .context("Shard planning failed")?;
    Ok(contexts)
}

async fn plan(config_path: &Path, format: &str) -> Result<()> {
    let contexts = plan_contexts(config_path).await?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&contexts)?;
            println!("{}", json);
        }
        _ => print_contexts(&contexts),
    }

    Ok(())
}

fn print_contexts(contexts: &[TestContext]) {
    if contexts.is_empty() {
        println!("No test contexts to run");
        return;
    }

    for (i, context) in contexts.iter().enumerate() {
        let header = style(format!("matrix-{i}")).bold();
        match context {
            TestContext::Instrumentation(ctx) => {
                println!("{} {}", header, style(&ctx.test).cyan());
                println!("  app: {}", ctx.app);
                for (j, shard) in ctx.shards.iter().enumerate() {
                    println!(
                        "  {} ({} tests)",
                        style(format!("shard-{j}")).green(),
                        shard.len()
                    );
                    for test in &shard.tests {
                        println!("    {}", test);
                    }
                }
                if !ctx.ignored_tests.is_empty() {
                    println!(
                        "  {} ({} tests)",
                        style("ignored").yellow(),
                        ctx.ignored_tests.len()
                    );
                    for test in &ctx.ignored_tests {
                        println!("    {}", test);
                    }
                }
            }
            TestContext::Robo(ctx) => {
                println!("{} robo {} (script {})", header, ctx.app, ctx.robo_script);
            }
            TestContext::SanityRobo(ctx) => {
                println!("{} robo {}", header, ctx.app);
            }
        }
    }
}

async fn dump_shards(config_path: &Path, output: &Path) -> Result<()> {
    let contexts = plan_contexts(config_path).await?;
    let file = ShardingFile::from_contexts(&contexts);
    file.save(output)?;

    let shards: usize = file.entries.values().map(|e| e.shards.len()).sum();
    println!(
        "Saved {} shards for {} matrices to {}",
        shards,
        file.entries.len(),
        output.display()
    );
    Ok(())
}

async fn list_tests(binary: PathBuf, targets: &[String], format: &str) -> Result<()> {
    let filter = TestFilter::from_test_targets(targets, &[])?;
    let path = binary.clone();
    let extracted = tokio::task::spawn_blocking(move || extract_tests(&path))
        .await?
        .with_context(|| format!("Failed to read test binary {}", binary.display()))?;
    let tests = extracted.schedulable(&filter);

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} tests:", tests.len());
            for test in &tests {
                let marker = if test.parameterized {
                    format!(" {}", style("[parameterized]").cyan())
                } else if test.ignored {
                    format!(" {}", style("[ignored]").yellow())
                } else {
                    String::new()
                };
                println!("  {}{}", test, marker);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        ShardPlanner::from_config(&config)?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            let run = &config.dexshard;
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Contexts: {}", resolve_contexts(run).len());
            match run.num_uniform_shards {
                Some(count) => println!("  Uniform shards: {}", count),
                None => println!("  Max test shards: {}", run.max_test_shards),
            }
            println!("  Test targets: {}", run.test_targets.len());
            println!("  Targets for shard: {}", run.test_targets_for_shard.len());
            let balancer = match run.balancer {
                config::BalancerKind::Cost => "cost",
                config::BalancerKind::RoundRobin => "round-robin",
            };
            println!("  Balancer: {}", balancer);
            if let Some(path) = &run.custom_sharding_file {
                println!("  Custom sharding: {}", path.display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
