//! Sync coordination
//!
//! Each node is split in two at construction:
//! - an [`ArrivalHandler`] handed to the transport (asynchronous arrival
//!   context)
//! - a [`LeaderCoordinator`] or [`FollowerCoordinator`] driven by the main
//!   loop through `tick()`
//!
//! The two halves only share the staging channel and the deferred queue.

mod arrival;
mod follower;
mod health;
mod leader;

pub use arrival::{ArrivalHandler, ArrivalStats};
pub use follower::FollowerCoordinator;
pub use health::HealthMonitor;
pub use leader::{BatchHandle, LeaderCoordinator};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use contracts::{
    Clock, ConnectionHealth, HapticDriver, LatencySnapshot, MotorEvent, NodeConfig, Transport,
    TransportError,
};
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock_sync::{ClockSyncEstimator, RoundTrip, SampleVerdict};
use crate::deferred::{DeferredExecutor, DeferredWork};
use crate::latency::LatencyInstrumentation;
use crate::protocol::Message;
use crate::scheduler::SchedulerHandle;

/// Keepalive exchanges awaiting completion
const PENDING_PINGS: usize = 8;

/// Carrier frequency used for test pulses
pub const TEST_PULSE_FREQUENCY_HZ: u16 = 250;

/// Delay between a test pulse request and its first activation
const TEST_PULSE_LEAD_US: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Schedules authoritatively and sends macrocycles
    Leader,
    /// Executes what the leader sends
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main-context counters of one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub keepalives_sent: u64,
    pub round_trips_accepted: u64,
    pub round_trips_rejected: u64,
    /// Completions whose PING was no longer pending
    pub orphan_round_trips: u64,
    pub macrocycles_sent: u64,
    pub macrocycles_acked: u64,
    /// Follower: batches handed to the scheduler
    pub macrocycles_scheduled: u64,
    /// Zero amplitude or unknown finger
    pub events_skipped: u64,
    /// Converted deadline outside the schedule horizon
    pub events_beyond_horizon: u64,
    pub test_pulses: u64,
    pub send_failures: u64,
    pub scheduler_failures: u64,
}

/// State owned by the main loop of either role; executes deferred work
pub(crate) struct NodeState<C> {
    role: Role,
    clock: C,
    transport: Arc<dyn Transport>,
    estimator: ClockSyncEstimator,
    health: HealthMonitor,
    health_tx: watch::Sender<ConnectionHealth>,
    scheduler: SchedulerHandle,
    /// `(seq, t1)` of keepalives not yet completed
    pending_pings: VecDeque<(u32, u64)>,
    stop_requested: bool,
    stats: NodeStats,
}

impl<C: Clock> NodeState<C> {
    pub(crate) fn new<D>(
        role: Role,
        config: &NodeConfig,
        clock: C,
        transport: Arc<dyn Transport>,
        driver: D,
    ) -> Self
    where
        C: Clone + 'static,
        D: HapticDriver + 'static,
    {
        let latency = Arc::new(LatencyInstrumentation::new(&config.latency));
        let scheduler =
            SchedulerHandle::spawn(driver, clock.clone(), config.schedule.clone(), latency);
        let now = clock.now_us();
        let (health_tx, _) = watch::channel(ConnectionHealth::Connected);
        Self {
            role,
            health: HealthMonitor::new(&config.keepalive, now),
            estimator: ClockSyncEstimator::new(config.clock_sync.clone()),
            clock,
            transport,
            health_tx,
            scheduler,
            pending_pings: VecDeque::with_capacity(PENDING_PINGS),
            stop_requested: false,
            stats: NodeStats::default(),
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_us()
    }

    pub(crate) fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let result = self.transport.send(&message.encode());
        if let Err(e) = &result {
            self.stats.send_failures += 1;
            counter!(
                "haptic_sync_send_failures_total",
                "role" => self.role.as_str(),
                "kind" => message.kind()
            )
            .increment(1);
            warn!(role = %self.role, kind = message.kind(), error = %e, "send failed");
        }
        result
    }

    pub(crate) fn remember_ping(&mut self, seq: u32, t1: u64) {
        if self.pending_pings.len() == PENDING_PINGS {
            self.pending_pings.pop_front();
        }
        self.pending_pings.push_back((seq, t1));
    }

    fn take_ping(&mut self, seq: u32) -> Option<u64> {
        let index = self.pending_pings.iter().position(|(s, _)| *s == seq)?;
        self.pending_pings.remove(index).map(|(_, t1)| t1)
    }

    fn complete_round_trip(&mut self, seq: u32, t2: u64, t3: u64, t4: u64) {
        let Some(t1) = self.take_ping(seq) else {
            self.stats.orphan_round_trips += 1;
            debug!(role = %self.role, seq, "round trip without pending ping");
            return;
        };

        if self.role == Role::Leader {
            // Completed report lets the follower record the same exchange
            let _ = self.send(Message::Pong {
                seq,
                t2,
                t3,
                t4: Some(t4),
            });
        }

        let sample = RoundTrip::new(t1, t2, t3, t4);
        let verdict = self.estimator.record(sample);
        if let Ok(rtt) = u64::try_from(sample.rtt_us()) {
            self.scheduler.latency().record_round_trip(rtt);
        }

        let label = match verdict {
            SampleVerdict::Accepted { .. } => {
                self.stats.round_trips_accepted += 1;
                observability::record_clock_offset(
                    self.role.as_str(),
                    &self.estimator.current_offset(),
                );
                "accepted"
            }
            SampleVerdict::Outlier {
                delay_us,
                min_delay_us,
            } => {
                self.stats.round_trips_rejected += 1;
                debug!(role = %self.role, seq, delay_us, min_delay_us, "outlier round trip rejected");
                "outlier"
            }
            SampleVerdict::Invalid => {
                self.stats.round_trips_rejected += 1;
                "invalid"
            }
        };
        counter!(
            "haptic_sync_round_trips_total",
            "role" => self.role.as_str(),
            "verdict" => label
        )
        .increment(1);
    }

    /// Queue one or two pulses on `finger` through the activation schedule
    fn schedule_pulse(&mut self, finger: u8, amplitude: u8, duration_ms: u16, count: u8) {
        self.stats.test_pulses += 1;
        let duration_us = u64::from(duration_ms) * 1_000;
        let start = self.now() + TEST_PULSE_LEAD_US;
        for i in 0..u64::from(count) {
            let on_at = start + i * 2 * duration_us;
            for event in [
                MotorEvent::activate(on_at, finger, amplitude, TEST_PULSE_FREQUENCY_HZ),
                MotorEvent::deactivate(on_at + duration_us, finger),
            ] {
                if let Err(e) = self.scheduler.enqueue(event) {
                    self.stats.scheduler_failures += 1;
                    warn!(role = %self.role, finger, error = %e, "test pulse not scheduled");
                }
            }
        }
    }

    fn publish_health(&mut self, health: ConnectionHealth) {
        match health {
            ConnectionHealth::Lost => warn!(role = %self.role, %health, "connection health changed"),
            _ => info!(role = %self.role, %health, "connection health changed"),
        }
        observability::record_health_transition(self.role.as_str(), health);
        self.health_tx.send_replace(health);
    }

    fn note_traffic(&mut self) {
        let now = self.now();
        if let Some(health) = self.health.record_traffic(now) {
            self.publish_health(health);
        }
    }

    /// Health re-evaluation without side effects
    pub(crate) fn poll_health(&mut self) -> Option<ConnectionHealth> {
        let now = self.now();
        self.health.evaluate(now)
    }

    /// Stop actuation first when the link is lost, then publish
    pub(crate) async fn apply_health(&mut self, health: ConnectionHealth) {
        if health.is_lost() {
            self.all_off().await;
        }
        self.publish_health(health);
    }

    pub(crate) async fn all_off(&mut self) {
        if let Err(e) = self.scheduler.all_off().await {
            self.stats.scheduler_failures += 1;
            error!(role = %self.role, error = %e, "all-off not confirmed");
        }
    }

    pub(crate) fn snapshot(&self) -> LatencySnapshot {
        let mut snapshot = self.scheduler.latency().snapshot();
        snapshot.offset = self.estimator.current_offset();
        snapshot
    }
}

impl<C: Clock> DeferredExecutor for NodeState<C> {
    fn execute(&mut self, work: DeferredWork) {
        self.note_traffic();
        match work {
            DeferredWork::PingReceived { seq, t1 } => self.remember_ping(seq, t1),
            DeferredWork::RoundTripCompleted { seq, t2, t3, t4 } => {
                self.complete_round_trip(seq, t2, t3, t4)
            }
            DeferredWork::MacrocycleAcked { seq } => {
                self.stats.macrocycles_acked += 1;
                counter!("haptic_sync_macrocycles_acked_total").increment(1);
                debug!(seq, "macrocycle acknowledged");
            }
            DeferredWork::StopSession => {
                info!(role = %self.role, "peer requested session stop");
                self.stop_requested = true;
            }
            DeferredWork::HapticPulse {
                finger,
                amplitude,
                duration_ms,
            } => self.schedule_pulse(finger, amplitude, duration_ms, 1),
            DeferredWork::HapticDoublePulse {
                finger,
                amplitude,
                duration_ms,
            } => self.schedule_pulse(finger, amplitude, duration_ms, 2),
            DeferredWork::LinkActivity => {}
        }
    }
}
