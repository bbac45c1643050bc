//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand, ValueEnum};

/// Split test units across parallel worker pipelines
#[derive(Parser, Debug)]
#[command(name = "pipesplit")]
#[command(author = "hephaex@gmail.com")]
#[command(version = "0.1.0")]
#[command(about = "Run test units across split-policy pipelines with forked workers")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Enable verbose output (same as --log-level debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run test units through the configured pipelines
    Run(RunArgs),

    /// Show how units would be assigned without starting workers
    Plan(PlanArgs),

    /// Validate a configuration file
    Validate(ValidateArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Output format for run results
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per result plus a summary box
    Summary,
    /// JSON lines per result plus a JSON summary
    Json,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration file (defaults to the standard locations)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Unit manifest (.json, .yaml or a text file of class names)
    #[arg(short, long)]
    pub units: String,

    /// Abort the whole run when a pipeline aborts
    #[arg(long)]
    pub fail_fast: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "summary")]
    pub format: OutputFormat,
}

/// Arguments for plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Configuration file (defaults to the standard locations)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Unit manifest
    #[arg(short, long)]
    pub units: String,

    /// List unassigned units by name
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Configuration file (defaults to the standard locations)
    #[arg(short, long)]
    pub config: Option<String>,
}

/// Arguments for config management
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output file
        #[arg(default_value = "pipesplit.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// List PIPESPLIT_* environment variables and their current values
    Env,
}
