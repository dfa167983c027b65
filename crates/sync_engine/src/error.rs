//! Sync engine error types

use contracts::{CapacityError, HwError, ProtocolError, TransportError};
use thiserror::Error;

/// Errors surfaced by the coordinators and the scheduler handle
#[derive(Debug, Error)]
pub enum SyncError {
    /// Radio send failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bounded container rejected an item
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("haptic driver error: {0}")]
    Hardware(#[from] HwError),

    /// Keepalive timeout: actuation stays halted
    #[error("connection lost, actuation halted")]
    LinkLost,

    /// Session already stopped; nothing more is scheduled
    #[error("session stopped")]
    SessionStopped,

    /// Scheduler command queue is full
    #[error("scheduler command queue full")]
    SchedulerBusy,

    /// Scheduling task has exited
    #[error("scheduler task stopped")]
    SchedulerStopped,
}
