//! Latency instrumentation
//!
//! Records scheduled-vs-actual drift from the firing path and round-trip
//! times from keepalive exchanges. Every record is a handful of relaxed
//! atomic updates: O(1), allocation-free and lock-free, so the scheduling
//! task can share it with the main loop through an `Arc`. When disabled,
//! `record_*` return before touching any counter.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use contracts::{DriftStats, LatencyConfig, LatencySnapshot, RttStats};
use tracing::debug;

#[derive(Debug)]
pub struct LatencyInstrumentation {
    enabled: AtomicBool,
    verbose: bool,
    late_threshold_us: i64,

    drift_count: AtomicU64,
    drift_sum: AtomicI64,
    drift_min: AtomicI64,
    drift_max: AtomicI64,
    late_count: AtomicU64,
    early_count: AtomicU64,

    rtt_count: AtomicU64,
    rtt_sum: AtomicU64,
    rtt_min: AtomicU64,
    rtt_max: AtomicU64,
}

impl LatencyInstrumentation {
    pub fn new(config: &LatencyConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            verbose: config.verbose,
            late_threshold_us: config.late_threshold_us as i64,
            drift_count: AtomicU64::new(0),
            drift_sum: AtomicI64::new(0),
            drift_min: AtomicI64::new(i64::MAX),
            drift_max: AtomicI64::new(i64::MIN),
            late_count: AtomicU64::new(0),
            early_count: AtomicU64::new(0),
            rtt_count: AtomicU64::new(0),
            rtt_sum: AtomicU64::new(0),
            rtt_min: AtomicU64::new(u64::MAX),
            rtt_max: AtomicU64::new(0),
        }
    }

    /// Instrumentation that never records
    pub fn disabled() -> Self {
        Self::new(&LatencyConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Record one firing; drift is `actual - scheduled`
    #[inline]
    pub fn record_execution(&self, scheduled_at: u64, actual_at: u64) {
        if !self.is_enabled() {
            return;
        }
        let drift = actual_at as i64 - scheduled_at as i64;

        self.drift_count.fetch_add(1, Ordering::Relaxed);
        self.drift_sum.fetch_add(drift, Ordering::Relaxed);
        self.drift_min.fetch_min(drift, Ordering::Relaxed);
        self.drift_max.fetch_max(drift, Ordering::Relaxed);

        let late = drift > self.late_threshold_us;
        if late {
            self.late_count.fetch_add(1, Ordering::Relaxed);
        } else if drift < 0 {
            self.early_count.fetch_add(1, Ordering::Relaxed);
        }

        if self.verbose {
            if late {
                debug!(scheduled_at, actual_at, drift_us = drift, "LATE activation");
            } else {
                debug!(scheduled_at, actual_at, drift_us = drift, "activation");
            }
        }
    }

    #[inline]
    pub fn record_round_trip(&self, rtt_us: u64) {
        if !self.is_enabled() {
            return;
        }
        self.rtt_count.fetch_add(1, Ordering::Relaxed);
        self.rtt_sum.fetch_add(rtt_us, Ordering::Relaxed);
        self.rtt_min.fetch_min(rtt_us, Ordering::Relaxed);
        self.rtt_max.fetch_max(rtt_us, Ordering::Relaxed);
    }

    /// Current statistics; the offset is left at its default for the caller
    /// to fill in from its estimator
    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.drift_count.load(Ordering::Relaxed);
        let drift = if count == 0 {
            DriftStats::default()
        } else {
            let min = self.drift_min.load(Ordering::Relaxed);
            let max = self.drift_max.load(Ordering::Relaxed);
            let late = self.late_count.load(Ordering::Relaxed);
            DriftStats {
                count,
                mean_us: self.drift_sum.load(Ordering::Relaxed) as f64 / count as f64,
                min_us: min,
                max_us: max,
                jitter_us: max.abs_diff(min),
                late_count: late,
                early_count: self.early_count.load(Ordering::Relaxed),
                late_fraction: late as f64 / count as f64,
            }
        };

        let rtt_count = self.rtt_count.load(Ordering::Relaxed);
        let rtt = if rtt_count == 0 {
            RttStats::default()
        } else {
            let min = self.rtt_min.load(Ordering::Relaxed);
            let max = self.rtt_max.load(Ordering::Relaxed);
            RttStats {
                count: rtt_count,
                mean_us: self.rtt_sum.load(Ordering::Relaxed) as f64 / rtt_count as f64,
                min_us: min,
                max_us: max,
                spread_us: max.saturating_sub(min),
            }
        };

        LatencySnapshot {
            enabled: self.is_enabled(),
            drift,
            rtt,
            offset: Default::default(),
        }
    }

    pub fn reset(&self) {
        self.drift_count.store(0, Ordering::Relaxed);
        self.drift_sum.store(0, Ordering::Relaxed);
        self.drift_min.store(i64::MAX, Ordering::Relaxed);
        self.drift_max.store(i64::MIN, Ordering::Relaxed);
        self.late_count.store(0, Ordering::Relaxed);
        self.early_count.store(0, Ordering::Relaxed);
        self.rtt_count.store(0, Ordering::Relaxed);
        self.rtt_sum.store(0, Ordering::Relaxed);
        self.rtt_min.store(u64::MAX, Ordering::Relaxed);
        self.rtt_max.store(0, Ordering::Relaxed);
    }
}
