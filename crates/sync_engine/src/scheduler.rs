//! Scheduling task
//!
//! A dedicated tokio task owns the [`ActivationSchedule`] and the haptic
//! driver, so device commands are only ever issued from one place. The main
//! loop talks to it through a [`SchedulerHandle`].
//!
//! The task cycles through four states, chosen by [`plan`]:
//! - `Idle`: nothing scheduled, wait for a command
//! - `Waiting`: next deadline further than `spin_threshold_us`, sleep in
//!   slices of at most `max_sleep_us` while listening for commands
//! - `Spinning`: pre-select the actuator, then busy-poll the clock
//! - `Firing`: execute every due event and record its drift

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{Clock, EventKind, HapticDriver, MotorEvent, ScheduleConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use crate::error::SyncError;
use crate::latency::LatencyInstrumentation;
use crate::schedule::ActivationSchedule;

const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Spin iterations between wall-clock checks
const SPIN_CHECK_EVERY: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Waiting { sleep_us: u64 },
    Spinning { deadline: u64 },
    Firing,
}

/// Pick the next state from the clock and the earliest deadline
pub fn plan(now_us: u64, next_deadline: Option<u64>, config: &ScheduleConfig) -> SchedulerState {
    match next_deadline {
        None => SchedulerState::Idle,
        Some(deadline) if deadline <= now_us => SchedulerState::Firing,
        Some(deadline) => {
            let remaining = deadline - now_us;
            if remaining <= config.spin_threshold_us {
                SchedulerState::Spinning { deadline }
            } else {
                SchedulerState::Waiting {
                    sleep_us: (remaining - config.spin_threshold_us).min(config.max_sleep_us),
                }
            }
        }
    }
}

/// Requests from the main loop
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Drop the current schedule (new macrocycle) and install these events
    Replace(Vec<MotorEvent>),
    Enqueue(MotorEvent),
    /// Drop the schedule and stop active fingers
    Clear,
    /// Drop the schedule and deactivate every finger, then acknowledge
    AllOff(oneshot::Sender<()>),
}

/// Counters maintained by the scheduling task
#[derive(Debug, Default)]
pub struct SchedulerStats {
    fired: AtomicU64,
    driver_errors: AtomicU64,
    rejected: AtomicU64,
    replaced: AtomicU64,
    all_off: AtomicU64,
}

impl SchedulerStats {
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn driver_errors(&self) -> u64 {
        self.driver_errors.load(Ordering::Relaxed)
    }

    /// Events refused because the schedule was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }

    /// Times every finger was forced off
    pub fn all_off(&self) -> u64 {
        self.all_off.load(Ordering::Relaxed)
    }
}

/// Synchronous core of the scheduling task
pub struct ActivationScheduler<D, C> {
    schedule: ActivationSchedule,
    driver: D,
    clock: C,
    config: ScheduleConfig,
    /// Bit per finger currently vibrating
    active: u16,
    prepared_for: Option<u64>,
    latency: Arc<LatencyInstrumentation>,
    stats: Arc<SchedulerStats>,
}

impl<D: HapticDriver, C: Clock> ActivationScheduler<D, C> {
    pub fn new(
        driver: D,
        clock: C,
        config: ScheduleConfig,
        latency: Arc<LatencyInstrumentation>,
    ) -> Self {
        Self {
            schedule: ActivationSchedule::new(config.capacity),
            driver,
            clock,
            config,
            active: 0,
            prepared_for: None,
            latency,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn schedule(&self) -> &ActivationSchedule {
        &self.schedule
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    pub fn state(&self) -> SchedulerState {
        plan(self.clock.now_us(), self.schedule.next_deadline(), &self.config)
    }

    pub fn apply(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Replace(events) => {
                self.stats.replaced.fetch_add(1, Ordering::Relaxed);
                self.reset_schedule();
                self.insert_all(events);
            }
            SchedulerCommand::Enqueue(event) => self.insert_all([event]),
            SchedulerCommand::Clear => self.reset_schedule(),
            SchedulerCommand::AllOff(ack) => {
                self.all_off();
                let _ = ack.send(());
            }
        }
    }

    /// Empty the schedule and deactivate every finger
    pub fn all_off(&mut self) {
        self.schedule.clear();
        self.prepared_for = None;
        self.active = 0;
        self.stats.all_off.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.driver.all_off() {
            self.stats.driver_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "all-off failed on at least one finger");
        }
    }

    /// Fire every event whose deadline has passed; returns how many fired
    pub fn fire_due(&mut self) -> usize {
        let mut fired = 0;
        while let Some(event) = self.schedule.dequeue_due(self.clock.now_us()) {
            self.fire(event);
            fired += 1;
        }
        fired
    }

    /// Pre-select the actuator of the next event, once per deadline
    pub fn prepare_next(&mut self) {
        let Some(event) = self.schedule.peek_next().copied() else {
            return;
        };
        if self.prepared_for == Some(event.execute_at) {
            return;
        }
        self.prepared_for = Some(event.execute_at);
        if let EventKind::Activate { frequency_hz, .. } = event.kind {
            if let Err(e) = self.driver.prepare(event.finger, frequency_hz) {
                self.stats.driver_errors.fetch_add(1, Ordering::Relaxed);
                warn!(finger = event.finger, error = %e, "pre-selection failed");
            }
        }
    }

    fn fire(&mut self, event: MotorEvent) {
        let actual = self.clock.now_us();
        let result = match event.kind {
            EventKind::Activate { amplitude, .. } => {
                self.active |= finger_bit(event.finger);
                self.driver.activate(event.finger, amplitude)
            }
            EventKind::Deactivate => {
                self.active &= !finger_bit(event.finger);
                self.driver.deactivate(event.finger)
            }
        };
        self.latency.record_execution(event.execute_at, actual);
        self.stats.fired.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = result {
            self.stats.driver_errors.fetch_add(1, Ordering::Relaxed);
            warn!(finger = event.finger, error = %e, "activation failed");
        } else {
            trace!(
                finger = event.finger,
                scheduled = event.execute_at,
                actual,
                "fired"
            );
        }
    }

    fn insert_all(&mut self, events: impl IntoIterator<Item = MotorEvent>) {
        for event in events {
            if event.finger >= self.driver.finger_count() {
                warn!(finger = event.finger, "event for unknown finger skipped");
                continue;
            }
            if let Err(e) = self.schedule.enqueue(event) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    finger = event.finger,
                    execute_at = event.execute_at,
                    error = %e,
                    "schedule full, event rejected"
                );
            }
        }
    }

    /// Superseded schedule: drop pending events and stop fingers left on
    fn reset_schedule(&mut self) {
        self.schedule.clear();
        self.prepared_for = None;
        let mut active = std::mem::take(&mut self.active);
        while active != 0 {
            let finger = active.trailing_zeros() as u8;
            active &= active - 1;
            if let Err(e) = self.driver.deactivate(finger) {
                self.stats.driver_errors.fetch_add(1, Ordering::Relaxed);
                warn!(finger, error = %e, "deactivation on reset failed");
            }
        }
    }

    /// Busy-poll until `deadline`, giving up after a wall-clock bound
    ///
    /// Returns false when the bound was hit first.
    fn spin_until(&self, deadline: u64) -> bool {
        let started = Instant::now();
        let bound = Duration::from_micros(self.config.spin_threshold_us.max(100) * 2);
        let mut spins = 0u32;
        loop {
            if self.clock.now_us() >= deadline {
                return true;
            }
            spins = spins.wrapping_add(1);
            if spins % SPIN_CHECK_EVERY == 0 && started.elapsed() > bound {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

impl<D, C> ActivationScheduler<D, C>
where
    D: HapticDriver + 'static,
    C: Clock + 'static,
{
    /// Run the state machine until every handle is dropped
    #[instrument(name = "scheduler_loop", skip_all)]
    pub async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCommand>) {
        debug!("scheduling task started");
        loop {
            match self.state() {
                SchedulerState::Idle => match rx.recv().await {
                    Some(command) => self.apply(command),
                    None => break,
                },
                SchedulerState::Waiting { sleep_us } => {
                    tokio::select! {
                        command = rx.recv() => match command {
                            Some(command) => self.apply(command),
                            None => break,
                        },
                        _ = tokio::time::sleep(Duration::from_micros(sleep_us)) => {}
                    }
                }
                SchedulerState::Spinning { deadline } => {
                    self.prepare_next();
                    if !self.spin_until(deadline) {
                        // Clock stalled; let pending commands in
                        while let Ok(command) = rx.try_recv() {
                            self.apply(command);
                        }
                        tokio::task::yield_now().await;
                    }
                }
                SchedulerState::Firing => {
                    self.fire_due();
                }
            }
        }

        self.all_off();
        debug!(fired = self.stats.fired(), "scheduling task stopped");
    }
}

fn finger_bit(finger: u8) -> u16 {
    1u16.checked_shl(u32::from(finger)).unwrap_or(0)
}

/// Handle to a running scheduling task
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
    stats: Arc<SchedulerStats>,
    latency: Arc<LatencyInstrumentation>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Spawn the scheduling task; it takes exclusive ownership of `driver`
    pub fn spawn<D, C>(
        driver: D,
        clock: C,
        config: ScheduleConfig,
        latency: Arc<LatencyInstrumentation>,
    ) -> Self
    where
        D: HapticDriver + 'static,
        C: Clock + 'static,
    {
        let scheduler = ActivationScheduler::new(driver, clock, config, Arc::clone(&latency));
        let stats = Arc::clone(scheduler.stats());
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let join = tokio::spawn(scheduler.run(rx));
        Self {
            tx,
            stats,
            latency,
            join,
        }
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    pub fn latency(&self) -> &Arc<LatencyInstrumentation> {
        &self.latency
    }

    /// Supersede the current schedule with a new macrocycle
    pub fn replace(&self, events: Vec<MotorEvent>) -> Result<(), SyncError> {
        self.try_send(SchedulerCommand::Replace(events))
    }

    pub fn enqueue(&self, event: MotorEvent) -> Result<(), SyncError> {
        self.try_send(SchedulerCommand::Enqueue(event))
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        self.try_send(SchedulerCommand::Clear)
    }

    /// Stop every actuator; resolves once the driver calls have returned
    pub async fn all_off(&self) -> Result<(), SyncError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::AllOff(ack_tx))
            .await
            .map_err(|_| SyncError::SchedulerStopped)?;
        ack_rx.await.map_err(|_| SyncError::SchedulerStopped)
    }

    /// Close the command queue and wait for the task to turn everything off
    #[instrument(name = "scheduler_shutdown", skip(self))]
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.join.await {
            error!(error = ?e, "scheduling task panicked");
        }
    }

    fn try_send(&self, command: SchedulerCommand) -> Result<(), SyncError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SyncError::SchedulerBusy,
            mpsc::error::TrySendError::Closed(_) => SyncError::SchedulerStopped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{HapticCall, RecordingHaptic};
    use contracts::{LatencyConfig, ManualClock, MonotonicClock};

    fn config() -> ScheduleConfig {
        ScheduleConfig::default()
    }

    #[test]
    fn test_plan_states() {
        let cfg = config();
        assert_eq!(plan(0, None, &cfg), SchedulerState::Idle);
        assert_eq!(plan(1_000, Some(1_000), &cfg), SchedulerState::Firing);
        assert_eq!(
            plan(1_000, Some(2_500), &cfg),
            SchedulerState::Spinning { deadline: 2_500 }
        );
        assert_eq!(
            plan(1_000, Some(3_500), &cfg),
            SchedulerState::Waiting { sleep_us: 500 }
        );
        // Long waits are sliced
        assert_eq!(
            plan(0, Some(1_000_000), &cfg),
            SchedulerState::Waiting { sleep_us: 1_000 }
        );
    }

    #[test]
    fn test_fire_due_in_order_and_records_drift() {
        let clock = ManualClock::new(0);
        let driver = RecordingHaptic::new(4);
        let log = driver.log();
        let latency = Arc::new(LatencyInstrumentation::new(&LatencyConfig {
            enabled: true,
            ..Default::default()
        }));
        let mut scheduler =
            ActivationScheduler::new(driver, clock.clone(), config(), Arc::clone(&latency));

        scheduler.apply(SchedulerCommand::Replace(vec![
            MotorEvent::deactivate(2_000, 1),
            MotorEvent::activate(1_000, 1, 70, 250),
            MotorEvent::activate(5_000, 2, 70, 250),
        ]));

        clock.set(2_100);
        assert_eq!(scheduler.fire_due(), 2);
        assert_eq!(
            log.calls(),
            vec![
                HapticCall::Activate { finger: 1, amplitude: 70 },
                HapticCall::Deactivate { finger: 1 },
            ]
        );
        assert_eq!(scheduler.schedule().len(), 1);
        assert_eq!(latency.snapshot().drift.count, 2);
        assert_eq!(latency.snapshot().drift.max_us, 1_100);
    }

    #[test]
    fn test_replace_discards_stale_events_and_stops_active_fingers() {
        let clock = ManualClock::new(0);
        let driver = RecordingHaptic::new(4);
        let log = driver.log();
        let mut scheduler = ActivationScheduler::new(
            driver,
            clock.clone(),
            config(),
            Arc::new(LatencyInstrumentation::disabled()),
        );

        scheduler.apply(SchedulerCommand::Replace(vec![
            MotorEvent::activate(100, 0, 50, 200),
            MotorEvent::deactivate(10_000, 0),
        ]));
        clock.set(100);
        scheduler.fire_due();

        scheduler.apply(SchedulerCommand::Replace(vec![MotorEvent::activate(
            20_000, 3, 50, 200,
        )]));

        assert_eq!(scheduler.schedule().len(), 1);
        assert_eq!(scheduler.schedule().next_deadline(), Some(20_000));
        assert_eq!(log.calls().last(), Some(&HapticCall::Deactivate { finger: 0 }));
    }

    #[test]
    fn test_overflow_counted_not_truncated() {
        let driver = RecordingHaptic::new(4);
        let mut scheduler = ActivationScheduler::new(
            driver,
            ManualClock::new(0),
            ScheduleConfig {
                capacity: 4,
                ..config()
            },
            Arc::new(LatencyInstrumentation::disabled()),
        );

        let events = (0..6).map(|i| MotorEvent::deactivate(100 + i, 0)).collect();
        scheduler.apply(SchedulerCommand::Replace(events));

        assert_eq!(scheduler.schedule().len(), 4);
        assert_eq!(scheduler.stats().rejected(), 2);
        assert_eq!(scheduler.schedule().next_deadline(), Some(100));
    }

    #[test]
    fn test_prepare_called_once_per_deadline() {
        let driver = RecordingHaptic::new(4);
        let log = driver.log();
        let mut scheduler = ActivationScheduler::new(
            driver,
            ManualClock::new(0),
            config(),
            Arc::new(LatencyInstrumentation::disabled()),
        );
        scheduler.apply(SchedulerCommand::Enqueue(MotorEvent::activate(1_000, 2, 40, 180)));

        scheduler.prepare_next();
        scheduler.prepare_next();

        assert_eq!(
            log.calls(),
            vec![HapticCall::Prepare {
                finger: 2,
                frequency_hz: 180
            }]
        );
    }

    #[tokio::test]
    async fn test_task_fires_on_time_with_real_clock() {
        let clock = MonotonicClock::new();
        let driver = RecordingHaptic::new(4);
        let log = driver.log();
        let latency = Arc::new(LatencyInstrumentation::new(&LatencyConfig {
            enabled: true,
            ..Default::default()
        }));
        let handle =
            SchedulerHandle::spawn(driver, clock.clone(), config(), Arc::clone(&latency));

        let start = clock.now_us();
        handle
            .replace(vec![
                MotorEvent::activate(start + 10_000, 0, 80, 250),
                MotorEvent::deactivate(start + 20_000, 0),
            ])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(handle.stats().fired(), 2);
        assert_eq!(log.activations(), 1);
        let drift = latency.snapshot().drift;
        assert!(drift.min_us >= 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_off_acknowledged_after_driver_calls() {
        let driver = RecordingHaptic::new(4);
        let log = driver.log();
        let handle = SchedulerHandle::spawn(
            driver,
            MonotonicClock::new(),
            config(),
            Arc::new(LatencyInstrumentation::disabled()),
        );
        handle
            .enqueue(MotorEvent::activate(u64::MAX / 2, 0, 10, 100))
            .unwrap();

        handle.all_off().await.unwrap();

        assert_eq!(log.all_off_count(), 1);
        assert_eq!(handle.stats().all_off(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_turns_everything_off() {
        let driver = RecordingHaptic::new(4);
        let log = driver.log();
        let handle = SchedulerHandle::spawn(
            driver,
            MonotonicClock::new(),
            config(),
            Arc::new(LatencyInstrumentation::disabled()),
        );
        handle.shutdown().await;
        assert_eq!(log.all_off_count(), 1);
    }
}
