//! Mock collaborators for tests and the simulation
//!
//! - [`RecordingHaptic`]: haptic driver logging every call with its instant
//! - [`MemoryTransport`]: transport capturing outbound frames

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use contracts::{HapticDriver, HwError, Transport, TransportError};

use crate::protocol::FRAME_TERMINATOR;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticCall {
    Prepare { finger: u8, frequency_hz: u16 },
    Activate { finger: u8, amplitude: u8 },
    Deactivate { finger: u8 },
    AllOff,
}

/// Shared view of a [`RecordingHaptic`]'s call log
#[derive(Debug, Clone, Default)]
pub struct HapticLog {
    records: Arc<Mutex<Vec<(Instant, HapticCall)>>>,
}

impl HapticLog {
    pub fn calls(&self) -> Vec<HapticCall> {
        lock(&self.records).iter().map(|(_, call)| *call).collect()
    }

    /// Calls with the wall-clock instant they were made
    pub fn records(&self) -> Vec<(Instant, HapticCall)> {
        lock(&self.records).clone()
    }

    pub fn activations(&self) -> usize {
        self.count(|c| matches!(c, HapticCall::Activate { .. }))
    }

    pub fn all_off_count(&self) -> usize {
        self.count(|c| matches!(c, HapticCall::AllOff))
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
    }

    fn count(&self, pred: impl Fn(&HapticCall) -> bool) -> usize {
        lock(&self.records).iter().filter(|(_, c)| pred(c)).count()
    }

    fn push(&self, call: HapticCall) {
        lock(&self.records).push((Instant::now(), call));
    }
}

/// Driver that records instead of vibrating
#[derive(Debug)]
pub struct RecordingHaptic {
    fingers: u8,
    log: HapticLog,
    fail_finger: Option<u8>,
}

impl RecordingHaptic {
    pub fn new(fingers: u8) -> Self {
        Self {
            fingers,
            log: HapticLog::default(),
            fail_finger: None,
        }
    }

    /// Make every call on `finger` fail (after being recorded)
    pub fn failing_on(mut self, finger: u8) -> Self {
        self.fail_finger = Some(finger);
        self
    }

    pub fn log(&self) -> HapticLog {
        self.log.clone()
    }

    fn check(&self, finger: u8) -> Result<(), HwError> {
        if finger >= self.fingers {
            return Err(HwError::InvalidFinger {
                finger,
                max: self.fingers.saturating_sub(1),
            });
        }
        if self.fail_finger == Some(finger) {
            return Err(HwError::device(finger, "injected failure"));
        }
        Ok(())
    }
}

impl HapticDriver for RecordingHaptic {
    fn finger_count(&self) -> u8 {
        self.fingers
    }

    fn prepare(&mut self, finger: u8, frequency_hz: u16) -> Result<(), HwError> {
        self.log.push(HapticCall::Prepare {
            finger,
            frequency_hz,
        });
        self.check(finger)
    }

    fn activate(&mut self, finger: u8, amplitude: u8) -> Result<(), HwError> {
        self.log.push(HapticCall::Activate { finger, amplitude });
        self.check(finger)
    }

    fn deactivate(&mut self, finger: u8) -> Result<(), HwError> {
        self.log.push(HapticCall::Deactivate { finger });
        self.check(finger)
    }

    fn all_off(&mut self) -> Result<(), HwError> {
        self.log.push(HapticCall::AllOff);
        Ok(())
    }
}

/// Transport that keeps every frame it is asked to send
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    frames: Arc<Mutex<Vec<Bytes>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with `Closed`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn frames(&self) -> Vec<Bytes> {
        lock(&self.frames).clone()
    }

    /// Frames as text, without the terminator
    pub fn sent_text(&self) -> Vec<String> {
        lock(&self.frames)
            .iter()
            .map(|f| {
                let body = f.strip_suffix(&[FRAME_TERMINATOR]).unwrap_or(&f[..]);
                String::from_utf8_lossy(body).into_owned()
            })
            .collect()
    }

    pub fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *lock(&self.frames))
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransportError::closed("memory"));
        }
        lock(&self.frames).push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}
