//! `info` command implementation.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use contracts::NodeConfig;
use tracing::info;

use crate::cli::InfoArgs;
use crate::error::CliError;

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()).into());
    }

    let config = ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let json = ConfigLoader::to_json(&config).context("Failed to serialize config")?;
        println!("{json}");
    } else {
        print_config_info(&config);
    }

    Ok(())
}

fn print_config_info(config: &NodeConfig) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                Haptic Sync Configuration                     ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let keepalive = &config.keepalive;
    println!("💓 Keepalive");
    println!("   ├─ Interval: {} ms", keepalive.interval_ms);
    println!(
        "   └─ Lost after: {} ms ({}x)",
        keepalive.timeout_us() / 1_000,
        keepalive.timeout_multiple
    );

    let sync = &config.clock_sync;
    println!("\n🕒 Clock Sync");
    println!(
        "   ├─ Window: {} samples (min {})",
        sync.window, sync.min_samples
    );
    println!(
        "   ├─ Outliers: > {}x median delay (floor {} us)",
        sync.outlier_multiple, sync.outlier_floor_us
    );
    println!(
        "   ├─ Confidence: high < {} us, medium < {} us over {} RTTs",
        sync.high_spread_us, sync.medium_spread_us, sync.confidence_window
    );
    println!("   ├─ Drift EMA alpha: {}", sync.ema_alpha);
    println!(
        "   └─ Lead time: {} us ({}..={} us)",
        sync.default_lead_time_us, sync.min_lead_time_us, sync.max_lead_time_us
    );

    let macrocycle = &config.macrocycle;
    println!("\n📦 Macrocycle");
    println!("   ├─ Max events: {}", macrocycle.max_events);
    println!("   ├─ Fingers: {}", macrocycle.max_fingers);
    println!("   ├─ Burst duration: {} ms", macrocycle.burst_duration_ms);
    println!(
        "   └─ Schedule horizon: {} us",
        macrocycle.max_schedule_horizon_us
    );

    println!("\n⚙️  Queues");
    println!("   ├─ Staging: {}", config.channel.staging_capacity);
    println!("   ├─ Deferred: {}", config.channel.deferred_capacity);
    println!(
        "   └─ Schedule: {} (spin below {} us, sleep at most {} us)",
        config.schedule.capacity, config.schedule.spin_threshold_us, config.schedule.max_sleep_us
    );

    let latency = &config.latency;
    println!("\n⏱️  Latency");
    println!(
        "   ├─ Instrumentation: {}{}",
        if latency.enabled { "on" } else { "off" },
        if latency.verbose { " (verbose)" } else { "" }
    );
    println!("   ├─ Late threshold: {} us", latency.late_threshold_us);
    println!("   └─ Alignment bound: {} us", latency.alignment_bound_us);

    let link = &config.link;
    println!("\n📡 Simulated Link");
    println!(
        "   ├─ Latency: {} us + 0..={} us jitter",
        link.latency_us, link.jitter_us
    );
    println!("   ├─ Loss rate: {}", link.loss_rate);
    println!(
        "   └─ Queue: {} frames of at most {} bytes",
        link.queue_capacity, link.max_payload
    );

    let sim = &config.simulation;
    println!("\n🧪 Simulation");
    println!(
        "   ├─ Cycles: {} every {} ms",
        sim.cycles, sim.cycle_period_ms
    );
    println!("   ├─ Follower clock skew: {} us", sim.follower_clock_skew_us);
    println!("   ├─ Tick: {} ms", sim.tick_ms);
    println!("   └─ Warm-up pings: {}", sim.warmup_pings);

    println!();
}
