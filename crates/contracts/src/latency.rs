//! Latency snapshot shared between the engine and reporting

use serde::{Deserialize, Serialize};

use crate::{ClockOffset, Confidence};

/// Scheduled-vs-actual execution drift statistics
///
/// Drift is `actual - scheduled` in microseconds; positive means late.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftStats {
    pub count: u64,
    pub mean_us: f64,
    pub min_us: i64,
    pub max_us: i64,
    /// `max - min`
    pub jitter_us: u64,
    pub late_count: u64,
    pub early_count: u64,
    pub late_fraction: f64,
}

/// Round-trip-time statistics from keepalive exchanges
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub count: u64,
    pub mean_us: f64,
    pub min_us: u64,
    pub max_us: u64,
    /// `max - min`, the basis of the confidence class
    pub spread_us: u64,
}

/// Point-in-time view of latency instrumentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub enabled: bool,
    pub drift: DriftStats,
    pub rtt: RttStats,
    pub offset: ClockOffset,
}

impl LatencySnapshot {
    pub fn confidence(&self) -> Confidence {
        self.offset.confidence
    }
}
