//! `simulate` command implementation.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use contracts::NodeConfig;
use tracing::{info, warn};

use crate::cli::SimulateArgs;
use crate::error::CliError;
use crate::simulation::Simulation;

/// Execute the `simulate` command
pub async fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let config = load_config(args)?;

    info!(
        cycles = config.simulation.cycles,
        loss_rate = config.link.loss_rate,
        latency_us = config.link.latency_us,
        "Configuration loaded"
    );

    let report = Simulation::new(config, args.seed)
        .run(shutdown_signal())
        .await
        .map_err(|e| CliError::simulation(format!("{e:#}")))?;

    if args.json {
        let json = report.to_json().context("Failed to serialize report")?;
        println!("{json}");
    } else {
        report.print_summary();
    }

    if !report.alignment.is_within_bound() {
        warn!(
            max_abs_us = report.alignment.max_abs_us,
            bound_us = report.alignment.bound_us,
            "Bilateral alignment exceeded its bound"
        );
    }

    info!("Haptic sync simulation finished");
    Ok(())
}

/// Load the config (or defaults) and apply CLI overrides
fn load_config(args: &SimulateArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::config_not_found(path.display().to_string()).into());
            }
            info!(config = %path.display(), "Loading configuration");
            ConfigLoader::load_from_path(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => {
            info!("No configuration file given, using defaults");
            NodeConfig::default()
        }
    };

    apply_overrides(&mut config, args);
    ConfigLoader::validate(&config).map_err(|e| CliError::config_validation(e.to_string()))?;
    Ok(config)
}

fn apply_overrides(config: &mut NodeConfig, args: &SimulateArgs) {
    if let Some(cycles) = args.cycles {
        info!(cycles, "Overriding cycle count from CLI");
        config.simulation.cycles = cycles;
    }
    if let Some(loss) = args.loss {
        info!(loss, "Overriding link loss rate from CLI");
        config.link.loss_rate = loss;
    }
    if let Some(latency_us) = args.latency_us {
        info!(latency_us, "Overriding link latency from CLI");
        config.link.latency_us = latency_us;
    }
    // the report is built from drift and RTT statistics
    config.latency.enabled = true;
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Received shutdown signal, stopping session...");
}
