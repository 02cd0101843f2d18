use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::ENV_CONFIG;

#[derive(Parser)]
#[command(name = "otelflow")]
#[command(version, about = "Telemetry collection pipeline for metrics, traces and logs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file (defaults to ./otelflow.json)
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the collector (default command)
    Start,
    /// Load and validate the configuration, then exit
    Validate,
}

/// Parsed CLI values consumed by configuration loading
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
}

pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig { config: cli.config };
    (config, cli.command)
}
