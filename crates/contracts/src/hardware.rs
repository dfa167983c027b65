//! Collaborator interfaces consumed by the sync core
//!
//! Implementations are injected at construction; nothing here is wired up
//! through late-bound callbacks.

use crate::{Burst, HwError, TransportError};

/// Vibration actuator driver
///
/// Calls are expected to complete in a bounded, small time (100-500us). The
/// scheduling task is the only caller while a session runs.
pub trait HapticDriver: Send {
    /// Number of addressable fingers
    fn finger_count(&self) -> u8;

    /// Pre-select channel and frequency ahead of an activation
    fn prepare(&mut self, _finger: u8, _frequency_hz: u16) -> Result<(), HwError> {
        Ok(())
    }

    fn activate(&mut self, finger: u8, amplitude: u8) -> Result<(), HwError>;

    fn deactivate(&mut self, finger: u8) -> Result<(), HwError>;

    /// Deactivate every finger, continuing past individual failures
    ///
    /// Returns the first failure, if any.
    fn all_off(&mut self) -> Result<(), HwError> {
        let mut first_err = None;
        for finger in 0..self.finger_count() {
            if let Err(e) = self.deactivate(finger) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl<D: HapticDriver + ?Sized> HapticDriver for Box<D> {
    fn finger_count(&self) -> u8 {
        (**self).finger_count()
    }

    fn prepare(&mut self, finger: u8, frequency_hz: u16) -> Result<(), HwError> {
        (**self).prepare(finger, frequency_hz)
    }

    fn activate(&mut self, finger: u8, amplitude: u8) -> Result<(), HwError> {
        (**self).activate(finger, amplitude)
    }

    fn deactivate(&mut self, finger: u8) -> Result<(), HwError> {
        (**self).deactivate(finger)
    }

    fn all_off(&mut self) -> Result<(), HwError> {
        (**self).all_off()
    }
}

/// Outbound half of the radio link
///
/// Delivery is best effort and may reorder. `send` must not block: it is
/// also called from the arrival context to answer pings.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Inbound half of the radio link
///
/// Invoked by the transport from its own (asynchronous) context whenever
/// bytes arrive. Must never block and never panic.
pub trait ByteSink: Send {
    fn on_bytes_received(&mut self, bytes: &[u8]);
}

/// Upstream pattern generator
///
/// Produces the bursts of one cycle; deltas are relative to the cycle start.
pub trait PatternSource: Send {
    fn next_cycle(&mut self) -> Vec<Burst>;
}
