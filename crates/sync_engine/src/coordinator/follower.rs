//! Follower role: executes the leader's macrocycles in local time

use std::sync::Arc;

use contracts::{
    Clock, ConnectionHealth, HapticDriver, LatencySnapshot, MacrocycleConfig, MotorEvent,
    NodeConfig, StagedEvent, Transport, MACROCYCLE_MAX_EVENTS,
};
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::channel::{event_channel, StagingConsumer};
use crate::clock_sync::ClockSyncEstimator;
use crate::deferred::{deferred_queue, DeferredConsumer};
use crate::scheduler::SchedulerStats;

use super::{ArrivalHandler, NodeState, NodeStats, Role};

pub struct FollowerCoordinator<C> {
    state: NodeState<C>,
    staging: StagingConsumer,
    deferred: DeferredConsumer,
    macrocycle: MacrocycleConfig,
    /// Converted events of the batch being received
    batch: Vec<MotorEvent>,
    batch_seq: Option<u32>,
    stopped: bool,
}

impl<C: Clock + Clone + 'static> FollowerCoordinator<C> {
    /// Build the follower and the arrival handler to register with the
    /// transport
    pub fn new<D: HapticDriver + 'static>(
        config: &NodeConfig,
        clock: C,
        transport: Arc<dyn Transport>,
        driver: D,
    ) -> (Self, ArrivalHandler<C>) {
        let (staging_tx, staging) = event_channel(config.channel.staging_capacity);
        let (deferred_tx, deferred) = deferred_queue(config.channel.deferred_capacity);
        let arrival = ArrivalHandler::new(
            Role::Follower,
            clock.clone(),
            config.link.max_payload,
            Some(staging_tx),
            deferred_tx,
            Arc::clone(&transport),
        );
        let follower = Self {
            state: NodeState::new(Role::Follower, config, clock, transport, driver),
            staging,
            deferred,
            macrocycle: config.macrocycle.clone(),
            batch: Vec::with_capacity(MACROCYCLE_MAX_EVENTS * 2),
            batch_seq: None,
            stopped: false,
        };
        (follower, arrival)
    }
}

impl<C: Clock> FollowerCoordinator<C> {
    /// One main-loop iteration
    ///
    /// Drains staged events, executes one deferred item and re-evaluates
    /// health. A peer stop request or a lost link turns the actuators off
    /// before anything is published.
    pub async fn tick(&mut self) -> ConnectionHealth {
        self.drain_staged();
        self.deferred.process_one(&mut self.state);

        if self.state.stop_requested {
            self.state.stop_requested = false;
            self.stop_session().await;
        }

        if let Some(health) = self.state.poll_health() {
            if health.is_lost() {
                self.discard_pending();
            }
            self.state.apply_health(health).await;
        }
        self.state.health.health()
    }

    /// Move staged events into the batch; a completed batch replaces the
    /// schedule
    fn drain_staged(&mut self) {
        for _ in 0..self.staging.capacity() {
            let Some(staged) = self.staging.unstage() else {
                break;
            };
            if staged.is_first_in_batch {
                self.batch.clear();
                self.batch_seq = Some(staged.sequence);
            } else if self.batch_seq != Some(staged.sequence) {
                // Rest of a batch whose start was discarded
                self.state.stats.events_skipped += 1;
                continue;
            }

            self.convert(&staged);

            if staged.is_last_in_batch {
                self.commit_batch(staged.sequence);
            }
        }
    }

    fn convert(&mut self, staged: &StagedEvent) {
        if staged.amplitude == 0 || staged.finger >= self.macrocycle.max_fingers {
            self.state.stats.events_skipped += 1;
            counter!("haptic_sync_events_skipped_total", "reason" => "invalid").increment(1);
            trace!(finger = staged.finger, amplitude = staged.amplitude, "event skipped");
            return;
        }

        let now = self.state.now();
        let local_at = self.state.estimator.to_local_time(staged.remote_execute_at);
        if local_at.abs_diff(now) > self.macrocycle.max_schedule_horizon_us {
            self.state.stats.events_beyond_horizon += 1;
            counter!("haptic_sync_events_skipped_total", "reason" => "horizon").increment(1);
            warn!(
                seq = staged.sequence,
                remote = staged.remote_execute_at,
                local_at,
                now,
                "event outside schedule horizon dropped"
            );
            return;
        }

        self.batch.extend(staged.to_events(local_at));
    }

    fn commit_batch(&mut self, seq: u32) {
        let events = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(MACROCYCLE_MAX_EVENTS * 2),
        );
        self.batch_seq = None;
        let count = events.len();
        match self.state.scheduler.replace(events) {
            Ok(()) => {
                self.state.stats.macrocycles_scheduled += 1;
                counter!("haptic_sync_macrocycles_received_total").increment(1);
                debug!(seq, events = count, "macrocycle scheduled");
            }
            Err(e) => {
                self.state.stats.scheduler_failures += 1;
                warn!(seq, error = %e, "macrocycle not scheduled");
            }
        }
    }

    fn discard_pending(&mut self) {
        let staged = self.staging.clear();
        let deferred = self.deferred.clear();
        self.batch.clear();
        self.batch_seq = None;
        if staged + deferred > 0 {
            debug!(staged, deferred, "pending work discarded");
        }
    }

    /// Clear everything pending and turn every actuator off
    #[instrument(name = "follower_stop_session", skip(self))]
    pub async fn stop_session(&mut self) {
        self.discard_pending();
        self.state.all_off().await;
        self.stopped = true;
        observability::record_latency_snapshot(Role::Follower.as_str(), &self.snapshot());
        info!(stats = ?self.state.stats, "follower session stopped");
    }

    /// Whether the leader ended the session (or `stop_session` ran)
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop the scheduling task; it turns every finger off on exit
    pub async fn shutdown(self) {
        self.state.scheduler.shutdown().await;
    }

    pub fn health(&self) -> ConnectionHealth {
        self.state.health.health()
    }

    pub fn health_watch(&self) -> watch::Receiver<ConnectionHealth> {
        self.state.health_tx.subscribe()
    }

    pub fn estimator(&self) -> &ClockSyncEstimator {
        &self.state.estimator
    }

    pub fn stats(&self) -> NodeStats {
        self.state.stats
    }

    pub fn scheduler_stats(&self) -> &Arc<SchedulerStats> {
        self.state.scheduler.stats()
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        self.state.snapshot()
    }
}
