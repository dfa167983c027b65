//! Simulation report.

use std::time::Duration;

use contracts::{ClockOffset, ConnectionHealth, LatencySnapshot};
use link::MetricsSnapshot;
use observability::AlignmentSummary;
use serde::Serialize;
use sync_engine::{ArrivalStats, NodeStats, SchedulerStats};

/// Scheduling-task counters at the end of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounts {
    pub fired: u64,
    pub driver_errors: u64,
    pub rejected: u64,
    pub replaced: u64,
    pub all_off: u64,
}

impl From<&SchedulerStats> for SchedulerCounts {
    fn from(stats: &SchedulerStats) -> Self {
        Self {
            fired: stats.fired(),
            driver_errors: stats.driver_errors(),
            rejected: stats.rejected(),
            replaced: stats.replaced(),
            all_off: stats.all_off(),
        }
    }
}

/// Arrival-context counters at the end of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArrivalCounts {
    pub messages: u64,
    pub macrocycles: u64,
    pub events_staged: u64,
    pub events_dropped: u64,
    pub incomplete_batches: u64,
    pub duplicates: u64,
    pub restarts: u64,
    pub parse_errors: u64,
    pub deferred_dropped: u64,
    pub reply_failures: u64,
}

impl From<&ArrivalStats> for ArrivalCounts {
    fn from(stats: &ArrivalStats) -> Self {
        Self {
            messages: stats.messages(),
            macrocycles: stats.macrocycles(),
            events_staged: stats.events_staged(),
            events_dropped: stats.events_dropped(),
            incomplete_batches: stats.incomplete_batches(),
            duplicates: stats.duplicates(),
            restarts: stats.restarts(),
            parse_errors: stats.parse_errors(),
            deferred_dropped: stats.deferred_dropped(),
            reply_failures: stats.reply_failures(),
        }
    }
}

/// Everything observed on one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub health: ConnectionHealth,
    pub offset: ClockOffset,
    pub stats: NodeStats,
    pub scheduler: SchedulerCounts,
    pub arrival: ArrivalCounts,
    pub latency: LatencySnapshot,
}

/// Delivery counters of one link direction
#[derive(Debug, Clone)]
pub struct LinkReport {
    pub name: String,
    pub metrics: MetricsSnapshot,
}

/// Statistics from a simulated session
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub duration: Duration,
    /// Macrocycles the leader attempted
    pub cycles: u32,
    pub events_sent: u64,
    /// Configured follower clock skew, i.e. the offset the estimator should find
    pub true_offset_us: i64,
    pub interrupted: bool,
    pub leader: NodeReport,
    pub follower: NodeReport,
    pub links: Vec<LinkReport>,
    pub alignment: AlignmentSummary,
}

impl SimulationReport {
    /// Follower estimate minus the configured skew
    pub fn offset_error_us(&self) -> i64 {
        self.follower.offset.value_us - self.true_offset_us
    }

    /// Share of leader-scheduled activations the follower matched (percent)
    pub fn delivery_rate(&self) -> f64 {
        let total = self.alignment.pairs + self.alignment.unmatched;
        if total > 0 {
            self.alignment.pairs as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Serialize the report for `--json`
    pub fn to_json(&self) -> serde_json::Result<String> {
        let alignment = &self.alignment;
        let view = JsonReport {
            duration_secs: self.duration.as_secs_f64(),
            cycles: self.cycles,
            events_sent: self.events_sent,
            interrupted: self.interrupted,
            true_offset_us: self.true_offset_us,
            offset_error_us: self.offset_error_us(),
            leader: &self.leader,
            follower: &self.follower,
            links: self
                .links
                .iter()
                .map(|link| JsonLink {
                    name: &link.name,
                    sent: link.metrics.sent,
                    delivered: link.metrics.delivered,
                    lost: link.metrics.lost,
                    dropped: link.metrics.dropped,
                    oversize: link.metrics.oversize,
                })
                .collect(),
            alignment: JsonAlignment {
                pairs: alignment.pairs,
                unmatched: alignment.unmatched,
                bound_us: alignment.bound_us,
                over_bound: alignment.over_bound,
                max_abs_us: alignment.max_abs_us,
                mean_error_us: alignment.error_us.mean,
                std_dev_us: alignment.error_us.std_dev,
                within_bound_rate: alignment.within_bound_rate,
                within_bound: alignment.is_within_bound(),
            },
        };
        serde_json::to_string_pretty(&view)
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                  Haptic Sync Session Report                  ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Macrocycles: {}", self.cycles);
        println!("   ├─ Events sent: {}", self.events_sent);
        if self.interrupted {
            println!("   └─ Stopped early by signal");
        } else {
            println!("   └─ Completed");
        }

        let offset = &self.follower.offset;
        println!("\n🕒 Clock Sync");
        println!(
            "   ├─ Follower offset: {} us ({}, {} samples)",
            offset.value_us, offset.confidence, offset.sample_count
        );
        println!("   ├─ True skew: {} us", self.true_offset_us);
        println!("   ├─ Estimate error: {} us", self.offset_error_us());
        let rtt = &self.follower.latency.rtt;
        println!(
            "   └─ RTT: mean {:.0} us, min {} us, max {} us, spread {} us",
            rtt.mean_us, rtt.min_us, rtt.max_us, rtt.spread_us
        );

        println!("\n🎯 Bilateral Alignment");
        let alignment = &self.alignment;
        println!("   ├─ Matched pairs: {}", alignment.pairs);
        println!(
            "   ├─ Unmatched activations: {} ({:.2}% delivered)",
            alignment.unmatched,
            self.delivery_rate()
        );
        println!("   ├─ Error (us): {}", alignment.error_us);
        println!("   ├─ Max |error|: {} us", alignment.max_abs_us);
        let verdict = if alignment.is_within_bound() { "✓" } else { "✗" };
        println!(
            "   └─ {verdict} Within {} us: {:.2}% ({} over)",
            alignment.bound_us, alignment.within_bound_rate, alignment.over_bound
        );

        for (label, node) in [("Leader", &self.leader), ("Follower", &self.follower)] {
            print_node(label, node);
        }

        println!("\n📡 Link");
        for (i, link) in self.links.iter().enumerate() {
            let prefix = if i == self.links.len() - 1 { "└─" } else { "├─" };
            println!("   {} {}: {}", prefix, link.name, link.metrics);
        }

        println!();
    }
}

fn print_node(label: &str, node: &NodeReport) {
    let stats = &node.stats;
    let drift = &node.latency.drift;
    println!("\n⚙️  {label} (health: {})", node.health);
    println!(
        "   ├─ Keepalives: {} sent, {} accepted, {} rejected",
        stats.keepalives_sent, stats.round_trips_accepted, stats.round_trips_rejected
    );
    println!(
        "   ├─ Macrocycles: {} sent, {} acked, {} scheduled",
        stats.macrocycles_sent, stats.macrocycles_acked, stats.macrocycles_scheduled
    );
    if stats.events_skipped + stats.events_beyond_horizon > 0 {
        println!(
            "   ├─ Events dropped: {} skipped, {} beyond horizon",
            stats.events_skipped, stats.events_beyond_horizon
        );
    }
    if node.arrival.parse_errors + node.arrival.duplicates + node.arrival.deferred_dropped > 0 {
        println!(
            "   ├─ Arrival: {} parse errors, {} duplicates, {} deferred dropped",
            node.arrival.parse_errors, node.arrival.duplicates, node.arrival.deferred_dropped
        );
    }
    println!(
        "   ├─ Scheduler: {} fired, {} rejected, {} driver errors",
        node.scheduler.fired, node.scheduler.rejected, node.scheduler.driver_errors
    );
    println!(
        "   └─ Drift: mean {:.0} us, max {} us, jitter {} us, late {:.1}%",
        drift.mean_us,
        drift.max_us,
        drift.jitter_us,
        drift.late_fraction * 100.0
    );
}

#[derive(Serialize)]
struct JsonReport<'a> {
    duration_secs: f64,
    cycles: u32,
    events_sent: u64,
    interrupted: bool,
    true_offset_us: i64,
    offset_error_us: i64,
    leader: &'a NodeReport,
    follower: &'a NodeReport,
    links: Vec<JsonLink<'a>>,
    alignment: JsonAlignment,
}

#[derive(Serialize)]
struct JsonLink<'a> {
    name: &'a str,
    sent: u64,
    delivered: u64,
    lost: u64,
    dropped: u64,
    oversize: u64,
}

#[derive(Serialize)]
struct JsonAlignment {
    pairs: u64,
    unmatched: u64,
    bound_us: u64,
    over_bound: u64,
    max_abs_us: u64,
    mean_error_us: f64,
    std_dev_us: f64,
    within_bound_rate: f64,
    within_bound: bool,
}
