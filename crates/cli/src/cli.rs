//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Haptic Sync - leader/follower synchronization for bilateral haptic gloves
#[derive(Parser, Debug)]
#[command(
    name = "haptic-sync",
    author,
    version,
    about = "Bilateral haptic synchronization core",
    long_about = "Clock-synchronized motor activation for a pair of haptic gloves.\n\n\
                  Runs a leader and a follower over a simulated radio link, validates \n\
                  configuration files and reports latency and alignment statistics."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "HAPTIC_SYNC_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "HAPTIC_SYNC_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a leader and a follower over the simulated link
    Simulate(SimulateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display the effective configuration
    Info(InfoArgs),
}

/// Arguments for the `simulate` command
#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Path to configuration file (TOML or JSON); defaults apply when omitted
    #[arg(short, long, env = "HAPTIC_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the number of macrocycles
    #[arg(long, env = "HAPTIC_SYNC_CYCLES")]
    pub cycles: Option<u32>,

    /// Override the link loss rate (0.0 - <1.0)
    #[arg(long, env = "HAPTIC_SYNC_LOSS")]
    pub loss: Option<f64>,

    /// Override the base one-way link latency in microseconds
    #[arg(long, env = "HAPTIC_SYNC_LATENCY_US")]
    pub latency_us: Option<u64>,

    /// Seed for reproducible link loss and jitter
    #[arg(long, env = "HAPTIC_SYNC_SEED")]
    pub seed: Option<u64>,

    /// Prometheus metrics port (disabled when omitted)
    #[arg(long, env = "HAPTIC_SYNC_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "config/haptic.toml", env = "HAPTIC_SYNC_CONFIG")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/haptic.toml", env = "HAPTIC_SYNC_CONFIG")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_overrides_parse() {
        let cli = Cli::try_parse_from([
            "haptic-sync",
            "-v",
            "--log-format",
            "compact",
            "simulate",
            "--cycles",
            "5",
            "--loss",
            "0.1",
            "--json",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 1);
        assert!(matches!(cli.log_format, LogFormat::Compact));
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.cycles, Some(5));
                assert_eq!(args.loss, Some(0.1));
                assert!(args.json);
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["haptic-sync", "-q", "-v", "info"]);
        assert!(result.is_err());
    }
}
