//! `validate` command implementation.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use contracts::NodeConfig;
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    keepalive_interval_ms: u64,
    keepalive_timeout_ms: u64,
    max_events: usize,
    max_fingers: u8,
    latency_enabled: bool,
    alignment_bound_us: u64,
}

impl From<&NodeConfig> for ConfigSummary {
    fn from(config: &NodeConfig) -> Self {
        Self {
            keepalive_interval_ms: config.keepalive.interval_ms,
            keepalive_timeout_ms: config.keepalive.timeout_us() / 1_000,
            max_events: config.macrocycle.max_events,
            max_fingers: config.macrocycle.max_fingers,
            latency_enabled: config.latency.enabled,
            alignment_bound_us: config.latency.alignment_bound_us,
        }
    }
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{json}");
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            error: Some(format!("File not found: {config_path}")),
            config_path,
            warnings: Vec::new(),
            summary: None,
        };
    }

    match ConfigLoader::load_from_path(&args.config) {
        Ok(config) => ValidationResult {
            valid: true,
            config_path,
            error: None,
            warnings: ConfigLoader::warnings(&config),
            summary: Some(ConfigSummary::from(&config)),
        },
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: Vec::new(),
            summary: None,
        },
    }
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!(
                "\n  Keepalive: every {} ms, lost after {} ms",
                summary.keepalive_interval_ms, summary.keepalive_timeout_ms
            );
            println!(
                "  Macrocycle: up to {} events on {} fingers",
                summary.max_events, summary.max_fingers
            );
            println!(
                "  Latency instrumentation: {}",
                if summary.latency_enabled { "on" } else { "off" }
            );
            println!("  Alignment bound: {} us", summary.alignment_bound_us);
        }

        if !result.warnings.is_empty() {
            println!("\n⚠ Warnings:");
            for warning in &result.warnings {
                println!("  - {warning}");
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {error}");
        }
    }
}
