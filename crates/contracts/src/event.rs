//! Motor events - the unit of work moved between queues
//!
//! A [`Burst`] is what the pattern source asks for; the leader expands it into
//! an Activate/Deactivate pair of [`MotorEvent`]s. On the follower the same
//! burst first travels as a [`StagedEvent`] that still carries the leader's
//! timestamp.

use serde::{Deserialize, Serialize};

/// Highest amplitude accepted by the actuators (percent)
pub const MAX_AMPLITUDE: u8 = 100;

/// What happens to the actuator when the event fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    /// Start vibrating
    Activate { amplitude: u8, frequency_hz: u16 },
    /// Stop vibrating
    Deactivate,
}

/// Absolute-time actuator command
///
/// `execute_at` is in local monotonic microseconds. Immutable once enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorEvent {
    pub execute_at: u64,
    pub finger: u8,
    pub kind: EventKind,
}

impl MotorEvent {
    pub fn activate(execute_at: u64, finger: u8, amplitude: u8, frequency_hz: u16) -> Self {
        Self {
            execute_at,
            finger,
            kind: EventKind::Activate {
                amplitude: amplitude.min(MAX_AMPLITUDE),
                frequency_hz,
            },
        }
    }

    pub fn deactivate(execute_at: u64, finger: u8) -> Self {
        Self {
            execute_at,
            finger,
            kind: EventKind::Deactivate,
        }
    }

    pub fn is_activate(&self) -> bool {
        matches!(self.kind, EventKind::Activate { .. })
    }
}

/// One timed activation requested by the pattern source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Burst {
    pub finger: u8,
    /// 0..=100 percent
    pub amplitude: u8,
    pub frequency_hz: u16,
    pub duration_ms: u16,
    /// Offset of the activation from the start of the cycle
    pub delta_ms: u32,
}

impl Burst {
    /// Activate/Deactivate pair for a cycle starting at `cycle_start_us`
    pub fn to_events(&self, cycle_start_us: u64) -> [MotorEvent; 2] {
        let on_at = cycle_start_us.saturating_add(u64::from(self.delta_ms) * 1_000);
        let off_at = on_at.saturating_add(u64::from(self.duration_ms) * 1_000);
        [
            MotorEvent::activate(on_at, self.finger, self.amplitude, self.frequency_hz),
            MotorEvent::deactivate(off_at, self.finger),
        ]
    }
}

/// Event staged by the arrival context, still in the leader's time base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedEvent {
    /// Macrocycle sequence number this event belongs to
    pub sequence: u32,
    /// Activation time in the leader's clock (base + delta)
    pub remote_execute_at: u64,
    pub finger: u8,
    pub amplitude: u8,
    pub frequency_hz: u16,
    pub duration_ms: u16,
    /// First event of a new macrocycle: the schedule is cleared before it lands
    pub is_first_in_batch: bool,
    /// Last event of the macrocycle: the batch is complete
    pub is_last_in_batch: bool,
}

impl StagedEvent {
    /// Expand into local-time Activate/Deactivate events
    pub fn to_events(&self, local_execute_at: u64) -> [MotorEvent; 2] {
        let off_at = local_execute_at.saturating_add(u64::from(self.duration_ms) * 1_000);
        [
            MotorEvent::activate(
                local_execute_at,
                self.finger,
                self.amplitude,
                self.frequency_hz,
            ),
            MotorEvent::deactivate(off_at, self.finger),
        ]
    }
}
