//! pipesplit - run test units across split-policy pipelines
//!
//! Each pipeline owns a pool of forked worker processes. Units are routed to
//! the first pipeline whose split policy accepts them and every unit gets
//! exactly one result.
//!
//! ## Usage
//!
//! ```bash
//! # Write an example configuration
//! pipesplit config init pipesplit.yaml
//!
//! # Show where units would go without starting workers
//! pipesplit plan --config pipesplit.yaml --units units.txt
//!
//! # Run everything, stopping the whole run if a pipeline aborts
//! pipesplit run --config pipesplit.yaml --units units.txt --fail-fast
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use pipesplit::config::{print_env_help, ConfigFile, EnvConfig};
use pipesplit::executor::{Dispatcher, ProcessLauncher};
use pipesplit::models::ResultRecord;
use pipesplit::policy::SplitPolicyEngine;
use pipesplit::source::{load_units, IterSource};
use pipesplit::utils::logger::{init_logger, LogLevel};
use pipesplit::utils::timer::format_duration;

mod cli;

use cli::{Args, OutputFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();
    let logging = LogOptions {
        verbose: args.verbose,
        level: args.log_level,
    };

    match args.command {
        cli::Command::Run(run_args) => {
            let passed = run_units(run_args, &logging, &env).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        cli::Command::Plan(plan_args) => {
            plan_units(plan_args, &logging, &env)?;
        }
        cli::Command::Validate(validate_args) => {
            validate_config(validate_args, &logging, &env)?;
        }
        cli::Command::Config(config_args) => {
            logging.init(&env, None)?;
            manage_config(config_args)?;
        }
    }

    Ok(())
}

/// Logging flags carried from the global arguments
struct LogOptions {
    verbose: bool,
    level: Option<String>,
}

impl LogOptions {
    /// `-v` beats `--log-level`, which beats `PIPESPLIT_LOG`, which beats the file.
    fn init(&self, env: &EnvConfig, file_level: Option<&str>) -> Result<()> {
        let level = if self.verbose {
            "debug".to_string()
        } else if let Some(level) = &self.level {
            level.clone()
        } else {
            env.log_level_or(file_level.unwrap_or("info"))
        };

        let level: LogLevel = level.parse().map_err(|e: String| anyhow!(e))?;
        init_logger(level);
        Ok(())
    }
}

/// `--config`, then `PIPESPLIT_CONFIG`, then the standard locations
fn resolve_config_path(explicit: Option<&str>, env: &EnvConfig) -> Result<PathBuf> {
    explicit
        .map(PathBuf::from)
        .or_else(|| env.config_file.as_ref().map(PathBuf::from))
        .or_else(ConfigFile::find)
        .ok_or_else(|| {
            anyhow!("No configuration file found. Pass --config or run `pipesplit config init`.")
        })
}

async fn run_units(args: cli::RunArgs, logging: &LogOptions, env: &EnvConfig) -> Result<bool> {
    let path = resolve_config_path(args.config.as_deref(), env)?;
    let file = ConfigFile::load(&path)?;
    logging.init(env, file.log_level.as_deref())?;

    let mut config = file.run;
    env.apply(&mut config);
    if args.fail_fast {
        config.fail_fast = true;
    }

    let units = load_units(&args.units)?;
    info!(
        "Loaded {} units from {} ({} pipelines, config {})",
        units.len(),
        args.units,
        config.pipelines.len(),
        path.display()
    );

    let launcher = Arc::new(ProcessLauncher::new(&config.fork));
    let dispatcher = Dispatcher::new(config, launcher)
        .with_context(|| format!("Invalid configuration: {}", path.display()))?;

    let mut handle = dispatcher.start(IterSource::new(units));
    let results = handle
        .take_results()
        .context("Result stream already taken")?;

    let token = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            token.cancel();
        }
    });

    let printer = tokio::spawn(print_results(results, args.format));
    let summary = handle.await_completion().await;
    printer.await.context("Result printer failed")??;

    match args.format {
        OutputFormat::Summary => {
            println!("\n{summary}");
            let elapsed = Duration::from_millis(summary.duration_ms);
            println!("Finished in {}", format_duration(elapsed));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }

    if !summary.is_conserved() {
        warn!(
            "Run summary does not account for every unit ({} submitted, {} accounted)",
            summary.submitted,
            summary.accounted()
        );
    }

    Ok(summary.is_all_passed())
}

async fn print_results(
    mut results: UnboundedReceiver<ResultRecord>,
    format: OutputFormat,
) -> Result<()> {
    while let Some(record) = results.recv().await {
        match format {
            OutputFormat::Summary => println!("{record}"),
            OutputFormat::Json => println!("{}", serde_json::to_string(&record)?),
        }
    }
    Ok(())
}

fn plan_units(args: cli::PlanArgs, logging: &LogOptions, env: &EnvConfig) -> Result<()> {
    let path = resolve_config_path(args.config.as_deref(), env)?;
    // Parsed without validation so ordering mistakes show up in the plan.
    let file = ConfigFile::read(&path)?;
    logging.init(env, file.log_level.as_deref())?;

    let engine = SplitPolicyEngine::from_pipelines(&file.run.pipelines)
        .with_context(|| format!("Invalid split policy in {}", path.display()))?;
    let units = load_units(&args.units)?;
    let plan = engine.plan(&units);

    println!("\nAssignment plan for {} units\n", plan.total());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (pipeline, count) in &plan.counts {
        println!("  {pipeline:20} {count:>6} units");
    }
    println!("  {:20} {:>6} units", "(unassigned)", plan.unassigned.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    for shadowed in engine.shadowed() {
        println!(
            "⚠ Pipeline '{shadowed}' can never receive units: an earlier pipeline takes everything"
        );
    }

    if args.detailed && !plan.unassigned.is_empty() {
        println!("Unassigned units:");
        for unit in &plan.unassigned {
            println!("  - {unit}");
        }
        println!();
    }

    if let Err(e) = file.validate() {
        println!("✗ Configuration would be rejected by `run`: {e:#}");
    }

    Ok(())
}

fn validate_config(args: cli::ValidateArgs, logging: &LogOptions, env: &EnvConfig) -> Result<()> {
    let path = resolve_config_path(args.config.as_deref(), env)?;
    logging.init(env, None)?;

    match ConfigFile::load(&path) {
        Ok(file) => {
            println!("✓ Configuration file is valid: {}", path.display());
            for pipeline in &file.run.pipelines {
                println!(
                    "  {:20} {:2} workers  {}",
                    pipeline.id,
                    pipeline.workers,
                    pipeline.worker.program.as_deref().unwrap_or("(default launcher)")
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration file is invalid: {}", path.display());
            println!("  Error: {e:#}");
            Err(e)
        }
    }
}

fn manage_config(args: cli::ConfigArgs) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("✓ Configuration file created: {output}");
            println!("\nEdit the pipelines and worker commands to match your test runner.");
        }

        cli::ConfigAction::Show { format } => {
            let config = ConfigFile::load_default()?;
            let output = if format == "json" {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }

        cli::ConfigAction::Env => {
            print_env_help();
            println!();
            EnvConfig::load().print_summary();
        }
    }

    Ok(())
}
