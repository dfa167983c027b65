//! Leader role: batches the pattern into macrocycles and drives keepalives

use std::sync::Arc;

use contracts::{
    Burst, CapacityError, Clock, ConnectionHealth, HapticDriver, LatencySnapshot, MotorEvent,
    NodeConfig, PatternSource, Transport,
};
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clock_sync::ClockSyncEstimator;
use crate::deferred::{deferred_queue, DeferredConsumer};
use crate::error::SyncError;
use crate::protocol::{Macrocycle, MacrocycleEvent, Message};
use crate::scheduler::SchedulerStats;

use super::{ArrivalHandler, NodeState, NodeStats, Role};

/// Deferred items executed per tick
const DEFERRED_PER_TICK: usize = 4;

/// Macrocycle under construction
#[derive(Debug, Clone)]
pub struct BatchHandle {
    macrocycle: Macrocycle,
    max_events: usize,
    burst_duration_ms: u16,
}

impl BatchHandle {
    pub fn seq(&self) -> u32 {
        self.macrocycle.seq
    }

    /// Base time in the leader's clock
    pub fn execute_at_us(&self) -> u64 {
        self.macrocycle.execute_at_us
    }

    pub fn len(&self) -> usize {
        self.macrocycle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macrocycle.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_events
    }

    /// Activate/Deactivate pairs in the leader's clock
    pub fn local_events(&self) -> Vec<MotorEvent> {
        self.macrocycle
            .events()
            .iter()
            .flat_map(|ev| {
                Burst {
                    finger: ev.finger,
                    amplitude: ev.amplitude,
                    frequency_hz: ev.frequency_hz,
                    duration_ms: ev.duration_ms,
                    delta_ms: ev.delta_ms,
                }
                .to_events(self.execute_at_us())
            })
            .collect()
    }

    fn push(&mut self, event: MacrocycleEvent) -> Result<(), CapacityError> {
        if self.is_full() {
            return Err(CapacityError::full(self.max_events));
        }
        self.macrocycle.push(event)
    }
}

pub struct LeaderCoordinator<C> {
    state: NodeState<C>,
    deferred: DeferredConsumer,
    max_events: usize,
    burst_duration_ms: u16,
    keepalive_interval_us: u64,
    next_macrocycle_seq: u32,
    next_ping_seq: u32,
    last_keepalive_us: Option<u64>,
    /// Latched by `stop_session` and by losing the link
    stopped: bool,
}

impl<C: Clock + Clone + 'static> LeaderCoordinator<C> {
    /// Build the leader and the arrival handler to register with the transport
    pub fn new<D: HapticDriver + 'static>(
        config: &NodeConfig,
        clock: C,
        transport: Arc<dyn Transport>,
        driver: D,
    ) -> (Self, ArrivalHandler<C>) {
        let (deferred_tx, deferred) = deferred_queue(config.channel.deferred_capacity);
        let arrival = ArrivalHandler::new(
            Role::Leader,
            clock.clone(),
            config.link.max_payload,
            None,
            deferred_tx,
            Arc::clone(&transport),
        );
        let leader = Self {
            state: NodeState::new(Role::Leader, config, clock, transport, driver),
            deferred,
            max_events: config.macrocycle.max_events,
            burst_duration_ms: config.macrocycle.burst_duration_ms,
            keepalive_interval_us: config.keepalive.interval_us(),
            next_macrocycle_seq: 0,
            next_ping_seq: 0,
            last_keepalive_us: None,
            stopped: false,
        };
        (leader, arrival)
    }
}

impl<C: Clock> LeaderCoordinator<C> {
    /// Open a batch whose base time is `now + adaptive lead`
    pub fn begin_macrocycle(&mut self) -> BatchHandle {
        let seq = self.next_macrocycle_seq;
        self.next_macrocycle_seq = self.next_macrocycle_seq.wrapping_add(1);
        let execute_at_us = self.state.now() + self.state.estimator.adaptive_lead_time_us();
        BatchHandle {
            macrocycle: Macrocycle::new(seq, execute_at_us),
            max_events: self.max_events,
            burst_duration_ms: self.burst_duration_ms,
        }
    }

    /// Add a burst of the configured duration, `delta_ms` after the base time
    pub fn add_event(
        &self,
        handle: &mut BatchHandle,
        finger: u8,
        amplitude: u8,
        frequency_hz: u16,
        delta_ms: u32,
    ) -> Result<(), CapacityError> {
        let duration_ms = handle.burst_duration_ms;
        handle.push(MacrocycleEvent {
            amplitude,
            finger,
            frequency_hz,
            duration_ms,
            delta_ms,
        })
    }

    pub fn add_burst(&self, handle: &mut BatchHandle, burst: &Burst) -> Result<(), CapacityError> {
        handle.push(MacrocycleEvent {
            amplitude: burst.amplitude,
            finger: burst.finger,
            frequency_hz: burst.frequency_hz,
            duration_ms: burst.duration_ms,
            delta_ms: burst.delta_ms,
        })
    }

    /// Refuse new actuation once the session is over or the link is lost
    fn ensure_active(&self) -> Result<(), SyncError> {
        if self.state.health.health().is_lost() {
            Err(SyncError::LinkLost)
        } else if self.stopped {
            Err(SyncError::SessionStopped)
        } else {
            Ok(())
        }
    }

    /// Send the batch, then schedule it locally
    ///
    /// A batch the follower never saw is not executed here either. Empty
    /// batches are not sent. Nothing is sent or scheduled after the session
    /// stopped or the link was lost.
    #[instrument(
        name = "leader_commit",
        skip(self, handle),
        fields(seq = handle.seq(), events = handle.len())
    )]
    pub fn commit_and_send(&mut self, handle: BatchHandle) -> Result<(), SyncError> {
        self.ensure_active()?;
        if handle.is_empty() {
            debug!("empty macrocycle not sent");
            return Ok(());
        }

        self.state.send(Message::Macrocycle(handle.macrocycle))?;
        self.state.stats.macrocycles_sent += 1;
        counter!("haptic_sync_macrocycles_sent_total").increment(1);

        if let Err(e) = self.state.scheduler.replace(handle.local_events()) {
            self.state.stats.scheduler_failures += 1;
            return Err(e);
        }
        Ok(())
    }

    /// Fetch one cycle from `source` and commit it; returns the events sent
    pub fn run_cycle<P: PatternSource + ?Sized>(
        &mut self,
        source: &mut P,
    ) -> Result<usize, SyncError> {
        let bursts = source.next_cycle();
        let mut handle = self.begin_macrocycle();
        for burst in &bursts {
            if let Err(e) = self.add_burst(&mut handle, burst) {
                warn!(
                    requested = bursts.len(),
                    error = %e,
                    "pattern cycle truncated to macrocycle capacity"
                );
                break;
            }
        }
        let sent = handle.len();
        self.commit_and_send(handle)?;
        Ok(sent)
    }

    /// Send `PING:<seq>|<t1>`; failures are counted, not returned
    pub fn send_keepalive(&mut self) {
        let seq = self.next_ping_seq;
        self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
        let t1 = self.state.now();
        self.last_keepalive_us = Some(t1);
        self.state.remember_ping(seq, t1);
        if self.state.send(Message::Ping { seq, t1 }).is_ok() {
            self.state.stats.keepalives_sent += 1;
            counter!("haptic_sync_keepalives_sent_total").increment(1);
        }
    }

    /// Ask the follower to pulse `finger` once or twice, and pulse locally
    pub fn send_test_pulse(
        &mut self,
        finger: u8,
        amplitude: u8,
        duration_ms: u16,
        count: u8,
    ) -> Result<(), SyncError> {
        self.ensure_active()?;
        let count = count.clamp(1, 2);
        self.state.send(Message::Pulse {
            finger,
            amplitude,
            duration_ms,
            count,
        })?;
        self.state.schedule_pulse(finger, amplitude, duration_ms, count);
        Ok(())
    }

    /// One main-loop iteration
    pub async fn tick(&mut self) -> ConnectionHealth {
        for _ in 0..DEFERRED_PER_TICK {
            if !self.deferred.process_one(&mut self.state) {
                break;
            }
        }

        let now = self.state.now();
        let due = self
            .last_keepalive_us
            .map_or(true, |last| now.saturating_sub(last) >= self.keepalive_interval_us);
        if due {
            self.send_keepalive();
        }

        match self.state.poll_health() {
            Some(ConnectionHealth::Lost) => self.halt_on_loss().await,
            Some(health) => self.state.apply_health(health).await,
            None => {}
        }
        self.state.health.health()
    }

    /// Lost link: actuators off, best-effort STOP to the follower, session
    /// latched stopped, then the state change is published
    async fn halt_on_loss(&mut self) {
        self.deferred.clear();
        self.state.all_off().await;
        let _ = self.state.send(Message::Stop {
            seq: self.next_macrocycle_seq,
        });
        self.stopped = true;
        warn!(stats = ?self.state.stats, "link lost, leader session halted");
        self.state.publish_health(ConnectionHealth::Lost);
    }

    /// Tell the follower to stop, then stop local actuation
    #[instrument(name = "leader_stop_session", skip(self))]
    pub async fn stop_session(&mut self) -> Result<(), SyncError> {
        let sent = self.state.send(Message::Stop {
            seq: self.next_macrocycle_seq,
        });
        self.deferred.clear();
        self.state.all_off().await;
        self.stopped = true;
        observability::record_latency_snapshot(Role::Leader.as_str(), &self.snapshot());
        info!(stats = ?self.state.stats, "leader session stopped");
        sent.map_err(SyncError::from)
    }

    /// Stop the scheduling task; it turns every finger off on exit
    pub async fn shutdown(self) {
        self.state.scheduler.shutdown().await;
    }

    pub fn health(&self) -> ConnectionHealth {
        self.state.health.health()
    }

    /// Whether the session ended, locally or through a lost link
    pub fn is_stopped(&self) -> bool {
        self.stopped
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryTransport, RecordingHaptic};
    use contracts::{ManualClock, NodeConfig};
    use std::time::Duration;

    fn leader() -> (
        LeaderCoordinator<ManualClock>,
        ArrivalHandler<ManualClock>,
        MemoryTransport,
        ManualClock,
    ) {
        let clock = ManualClock::new(1_000_000);
        let transport = MemoryTransport::new();
        let (leader, arrival) = LeaderCoordinator::new(
            &NodeConfig::default(),
            clock.clone(),
            Arc::new(transport.clone()),
            RecordingHaptic::new(4),
        );
        (leader, arrival, transport, clock)
    }

    #[tokio::test]
    async fn test_commit_sends_macrocycle_with_default_lead() {
        let (mut leader, _arrival, transport, _clock) = leader();

        let mut batch = leader.begin_macrocycle();
        assert_eq!(batch.execute_at_us(), 1_050_000);
        leader.add_event(&mut batch, 1, 80, 250, 0).unwrap();
        leader.add_event(&mut batch, 2, 80, 250, 167).unwrap();
        leader.commit_and_send(batch).unwrap();

        assert_eq!(
            transport.sent_text(),
            vec!["MC:0|1050000|2|80,1,250,100,0|80,2,250,100,1,167".to_string()]
        );
        assert_eq!(leader.stats().macrocycles_sent, 1);
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_thirteenth_event_rejected() {
        let (mut leader, _arrival, _transport, _clock) = leader();
        let mut batch = leader.begin_macrocycle();
        for i in 0..12 {
            leader.add_event(&mut batch, i % 4, 50, 200, u32::from(i) * 10).unwrap();
        }
        assert!(leader.add_event(&mut batch, 0, 50, 200, 999).is_err());
        assert_eq!(batch.len(), 12);
        assert_eq!(batch.local_events().len(), 24);
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_send_is_not_scheduled_locally() {
        let (mut leader, _arrival, transport, _clock) = leader();
        transport.set_failing(true);

        let mut batch = leader.begin_macrocycle();
        leader.add_event(&mut batch, 0, 80, 250, 0).unwrap();
        let err = leader.commit_and_send(batch).unwrap_err();

        assert!(matches!(err, SyncError::Transport(_)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(leader.scheduler_stats().replaced(), 0);
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_not_sent() {
        let (mut leader, _arrival, transport, _clock) = leader();
        let batch = leader.begin_macrocycle();
        leader.commit_and_send(batch).unwrap();
        assert!(transport.sent_text().is_empty());
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_keepalive_round_trip_forwards_completed_pong() {
        use contracts::ByteSink;

        let (mut leader, mut arrival, transport, clock) = leader();

        leader.tick().await;
        assert_eq!(transport.sent_text(), vec!["PING:0|1000000".to_string()]);

        // Follower clock runs 500ms ahead, 10ms each way
        clock.set(1_020_000);
        arrival.on_bytes_received(b"PONG:0|1510000|1510000\x04");
        leader.tick().await;

        let sent = transport.sent_text();
        assert_eq!(sent[1], "PONG:0|1510000|1510000|1020000");
        assert_eq!(leader.stats().round_trips_accepted, 1);
        // One sample is not enough to trust
        assert_eq!(leader.snapshot().offset.value_us, 0);

        clock.set(2_000_000);
        leader.tick().await;
        assert_eq!(transport.sent_text()[2], "PING:1|2000000");
        clock.set(2_020_000);
        arrival.on_bytes_received(b"PONG:1|2510000|2510000\x04");
        leader.tick().await;

        assert_eq!(leader.stats().round_trips_accepted, 2);
        assert_eq!(leader.snapshot().offset.value_us, 500_000);
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_keepalive_sent_once_per_interval() {
        let (mut leader, _arrival, transport, clock) = leader();
        leader.tick().await;
        clock.advance_ms(500);
        leader.tick().await;
        clock.advance_ms(500);
        leader.tick().await;

        assert_eq!(transport.sent_text().len(), 2);
        assert_eq!(leader.stats().keepalives_sent, 2);
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_link_halts_and_refuses_new_batches() {
        let (mut leader, _arrival, transport, clock) = leader();
        let mut watch = leader.health_watch();

        leader.tick().await;
        clock.advance_ms(6_001);
        assert_eq!(leader.tick().await, ConnectionHealth::Lost);
        assert!(leader.is_stopped());
        assert_eq!(leader.scheduler_stats().all_off(), 1);
        assert_eq!(*watch.borrow_and_update(), ConnectionHealth::Lost);
        assert!(transport.sent_text().contains(&"STOP:0".to_string()));

        let before = transport.sent_text().len();
        let mut batch = leader.begin_macrocycle();
        leader.add_event(&mut batch, 0, 80, 250, 0).unwrap();
        assert!(matches!(
            leader.commit_and_send(batch),
            Err(SyncError::LinkLost)
        ));
        assert!(matches!(
            leader.send_test_pulse(0, 60, 20, 1),
            Err(SyncError::LinkLost)
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent_text().len(), before);
        assert_eq!(leader.scheduler_stats().replaced(), 0);
        assert_eq!(leader.stats().macrocycles_sent, 0);
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_session_stays_stopped_after_reconnect() {
        use contracts::ByteSink;

        let (mut leader, mut arrival, _transport, clock) = leader();
        leader.tick().await;
        clock.advance_ms(6_001);
        leader.tick().await;

        // Follower traffic brings the link back, not the session
        arrival.on_bytes_received(b"MC_ACK:0\x04");
        assert_eq!(leader.tick().await, ConnectionHealth::Connected);

        let mut batch = leader.begin_macrocycle();
        leader.add_event(&mut batch, 0, 80, 250, 0).unwrap();
        assert!(matches!(
            leader.commit_and_send(batch),
            Err(SyncError::SessionStopped)
        ));
        leader.shutdown().await;
    }
}
