//! Simulation orchestrator - runs a leader and a follower over the
//! simulated link and collects the session report.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{Clock, MonotonicClock, NodeConfig, Transport};
use link::{link_pair, SimulatedLink};
use observability::{record_link_drops, AlignmentAggregator};
use sync_engine::mock::RecordingHaptic;
use sync_engine::{FollowerCoordinator, LeaderCoordinator};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::alignment::align;
use super::pattern::SweepPattern;
use super::report::{ArrivalCounts, LinkReport, NodeReport, SchedulerCounts, SimulationReport};

/// Spacing of the keepalives sent before the first macrocycle
const WARMUP_SPACING: Duration = Duration::from_millis(50);

/// How long the follower gets to act on STOP before it is stopped locally
const FOLLOWER_STOP_GRACE: Duration = Duration::from_secs(1);

/// Simulated session
pub struct Simulation {
    config: NodeConfig,
    seed: Option<u64>,
}

impl Simulation {
    /// Create a session; `seed` makes link loss and jitter reproducible
    pub fn new(config: NodeConfig, seed: Option<u64>) -> Self {
        Self { config, seed }
    }

    /// Run until every cycle is sent or `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<SimulationReport>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let config = &self.config;
        let sim = &config.simulation;
        let tick = Duration::from_millis(sim.tick_ms.max(1));
        let mut shutdown = Box::pin(shutdown);

        // both clocks tick from the same instant; the follower's is shifted
        let origin = Instant::now();
        let leader_clock = MonotonicClock::with_origin(origin, 0);
        let follower_clock = MonotonicClock::with_origin(origin, sim.follower_clock_skew_us);

        let (mut to_follower, mut to_leader) = match self.seed {
            Some(seed) => (
                SimulatedLink::with_seed("leader->follower", &config.link, seed)?,
                SimulatedLink::with_seed("follower->leader", &config.link, seed.wrapping_add(1))?,
            ),
            None => link_pair(&config.link)?,
        };

        let leader_haptic = RecordingHaptic::new(config.macrocycle.max_fingers);
        let leader_log = leader_haptic.log();
        let follower_haptic = RecordingHaptic::new(config.macrocycle.max_fingers);
        let follower_log = follower_haptic.log();

        let leader_transport: Arc<dyn Transport> = Arc::new(to_follower.transport());
        let follower_transport: Arc<dyn Transport> = Arc::new(to_leader.transport());

        let (mut leader, leader_arrival) =
            LeaderCoordinator::new(config, leader_clock, leader_transport, leader_haptic);
        let (mut follower, follower_arrival) = FollowerCoordinator::new(
            config,
            follower_clock,
            follower_transport,
            follower_haptic,
        );

        let leader_arrival_stats = Arc::clone(leader_arrival.stats());
        let follower_arrival_stats = Arc::clone(follower_arrival.stats());
        let leader_scheduler = Arc::clone(leader.scheduler_stats());
        let follower_scheduler = Arc::clone(follower.scheduler_stats());

        to_leader
            .attach(leader_arrival)
            .context("Failed to attach leader to link")?;
        to_follower
            .attach(follower_arrival)
            .context("Failed to attach follower to link")?;

        info!(
            cycles = sim.cycles,
            cycle_period_ms = sim.cycle_period_ms,
            latency_us = config.link.latency_us,
            jitter_us = config.link.jitter_us,
            loss_rate = config.link.loss_rate,
            skew_us = sim.follower_clock_skew_us,
            "Simulated session starting"
        );

        // Follower main loop
        let (abort_tx, mut abort_rx) = oneshot::channel::<()>();
        let mut follower_task = tokio::spawn(async move {
            loop {
                follower.tick().await;
                if follower.is_stopped() {
                    break;
                }
                tokio::select! {
                    _ = &mut abort_rx => {
                        follower.stop_session().await;
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {}
                }
            }
            follower
        });

        // Leader main loop
        let mut interrupted = false;
        for _ in 0..sim.warmup_pings {
            leader.send_keepalive();
            if drive(&mut leader, WARMUP_SPACING, tick, &mut shutdown).await {
                interrupted = true;
                break;
            }
        }
        debug!(
            offset = ?leader.estimator().current_offset(),
            "Warm-up finished"
        );

        let period = Duration::from_millis(sim.cycle_period_ms);
        let mut pattern = SweepPattern::new(
            config.macrocycle.max_fingers,
            config.macrocycle.burst_duration_ms,
            sim.cycle_period_ms,
        );
        let mut cycles = 0u32;
        let mut events_sent = 0u64;
        if !interrupted {
            for cycle in 0..sim.cycles {
                match leader.run_cycle(&mut pattern) {
                    Ok(sent) => events_sent += sent as u64,
                    Err(e) => warn!(cycle, error = %e, "Macrocycle not sent"),
                }
                cycles += 1;
                if drive(&mut leader, period, tick, &mut shutdown).await {
                    interrupted = true;
                    break;
                }
                if leader.is_stopped() {
                    warn!(cycle, health = %leader.health(), "Leader halted, ending cycles");
                    break;
                }
            }
        }

        // let the last macrocycle play out on both sides
        if !interrupted && !leader.is_stopped() {
            let settle = Duration::from_micros(config.clock_sync.max_lead_time_us);
            interrupted = drive(&mut leader, settle, tick, &mut shutdown).await;
        }
        if interrupted {
            warn!(cycles, "Session interrupted, stopping");
        }

        if let Err(e) = leader.stop_session().await {
            warn!(error = %e, "STOP not delivered to follower");
        }

        let follower = match tokio::time::timeout(FOLLOWER_STOP_GRACE, &mut follower_task).await {
            Ok(joined) => joined.context("Follower task failed")?,
            Err(_) => {
                warn!("Follower did not acknowledge STOP in time, stopping it locally");
                // a dropped receiver means the task already finished
                let _ = abort_tx.send(());
                follower_task.await.context("Follower task failed")?
            }
        };

        let mut leader_report = NodeReport {
            health: leader.health(),
            offset: leader.estimator().current_offset(),
            stats: leader.stats(),
            scheduler: SchedulerCounts::default(),
            arrival: ArrivalCounts::from(leader_arrival_stats.as_ref()),
            latency: leader.snapshot(),
        };
        let mut follower_report = NodeReport {
            health: follower.health(),
            offset: follower.estimator().current_offset(),
            stats: follower.stats(),
            scheduler: SchedulerCounts::default(),
            arrival: ArrivalCounts::from(follower_arrival_stats.as_ref()),
            latency: follower.snapshot(),
        };

        leader.shutdown().await;
        follower.shutdown().await;
        leader_report.scheduler = SchedulerCounts::from(leader_scheduler.as_ref());
        follower_report.scheduler = SchedulerCounts::from(follower_scheduler.as_ref());

        let links = vec![link_report(&to_follower), link_report(&to_leader)];
        to_follower.shutdown().await;
        to_leader.shutdown().await;

        let mut aggregator = AlignmentAggregator::new(config.latency.alignment_bound_us);
        let window_us = sim.cycle_period_ms * 1_000 / 2;
        align(
            &leader_log.records(),
            &follower_log.records(),
            window_us,
            &mut aggregator,
        );

        let report = SimulationReport {
            duration: started.elapsed(),
            cycles,
            events_sent,
            true_offset_us: i64::try_from(sim.follower_clock_skew_us).unwrap_or(i64::MAX),
            interrupted,
            leader: leader_report,
            follower: follower_report,
            links,
            alignment: aggregator.summary(),
        };

        info!(
            duration_secs = report.duration.as_secs_f64(),
            pairs = report.alignment.pairs,
            max_abs_us = report.alignment.max_abs_us,
            offset_error_us = report.offset_error_us(),
            "Simulated session finished"
        );

        Ok(report)
    }
}

/// Tick the leader for `span`; returns true if `shutdown` fired
async fn drive<C, F>(
    leader: &mut LeaderCoordinator<C>,
    span: Duration,
    tick: Duration,
    shutdown: &mut F,
) -> bool
where
    C: Clock,
    F: Future<Output = ()> + Unpin,
{
    let deadline = tokio::time::Instant::now() + span;
    loop {
        leader.tick().await;
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::select! {
            _ = &mut *shutdown => return true,
            _ = tokio::time::sleep(tick.min(deadline - now)) => {}
        }
    }
}

fn link_report(link: &SimulatedLink) -> LinkReport {
    let metrics = link.metrics().snapshot();
    record_link_drops(link.name(), "loss", metrics.lost);
    record_link_drops(link.name(), "queue_full", metrics.dropped);
    record_link_drops(link.name(), "oversize", metrics.oversize);
    LinkReport {
        name: link.name().to_string(),
        metrics,
    }
}
