//! Local clocks and the estimated offset to the peer's clock

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic microsecond clock
///
/// Implementations must never go backwards.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

/// `Instant`-backed clock with an optional fixed skew
///
/// Two `MonotonicClock`s created with different skews behave like two devices
/// that booted at different times.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
    skew_us: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_origin(Instant::now(), 0)
    }

    /// Clock sharing `origin` with others, shifted forward by `skew_us`
    pub fn with_origin(origin: Instant, skew_us: u64) -> Self {
        Self { origin, skew_us }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64 + self.skew_us
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now.fetch_max(now_us, Ordering::SeqCst);
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.now.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.advance_us(delta_ms * 1_000);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Reliability of the current offset estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Classify a round-trip-time spread (max - min)
    pub fn from_spread(spread_us: u64, high_below_us: u64, medium_below_us: u64) -> Self {
        if spread_us < high_below_us {
            Self::High
        } else if spread_us < medium_below_us {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated `peer - local` clock difference
///
/// Starts at zero with [`Confidence::Low`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    pub value_us: i64,
    pub confidence: Confidence,
    /// Accepted round-trip samples so far
    pub sample_count: u32,
}

impl ClockOffset {
    /// Apply the offset to a timestamp from the other clock
    pub fn apply(&self, remote_us: u64) -> u64 {
        remote_us.saturating_add_signed(self.value_us)
    }
}
