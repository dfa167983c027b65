//! Configuration contracts shared across crates.
//!
//! Every section has a `Default` matching the deployed firmware values, so a
//! configuration file only needs to list what it overrides.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Hard cap on events per macrocycle (transport payload limit)
pub const MACROCYCLE_MAX_EVENTS: usize = 12;

/// Complete configuration of one node (and of the simulated pair)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NodeConfig {
    #[validate(nested)]
    pub keepalive: KeepaliveConfig,
    #[validate(nested)]
    pub clock_sync: ClockSyncConfig,
    #[validate(nested)]
    pub channel: ChannelConfig,
    #[validate(nested)]
    pub schedule: ScheduleConfig,
    #[validate(nested)]
    pub macrocycle: MacrocycleConfig,
    #[validate(nested)]
    pub latency: LatencyConfig,
    #[validate(nested)]
    pub link: LinkConfig,
    #[validate(nested)]
    pub simulation: SimulationConfig,
}

/// Keepalive and failure detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// PING period on the leader
    #[validate(range(min = 10))]
    pub interval_ms: u64,
    /// Silence longer than `interval_ms * timeout_multiple` means `Lost`
    #[validate(range(min = 1))]
    pub timeout_multiple: u32,
}

impl KeepaliveConfig {
    pub fn interval_us(&self) -> u64 {
        self.interval_ms * 1_000
    }

    pub fn timeout_us(&self) -> u64 {
        self.interval_us() * u64::from(self.timeout_multiple)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_multiple: 6,
        }
    }
}

/// Clock offset estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// Samples kept for the minimum-delay window
    #[validate(range(min = 1, max = 64))]
    pub window: usize,
    /// Reject samples whose delay exceeds `min_delay * outlier_multiple`
    #[validate(range(exclusive_min = 1.0))]
    pub outlier_multiple: f64,
    /// Delays at or below this are never treated as outliers
    pub outlier_floor_us: u64,
    /// Round-trip times considered for the confidence spread
    #[validate(range(min = 2, max = 64))]
    pub confidence_window: usize,
    /// Spread below this is `High`
    pub high_spread_us: u64,
    /// Spread below this (and not `High`) is `Medium`
    pub medium_spread_us: u64,
    /// Samples required before the offset is trusted
    #[validate(range(min = 1))]
    pub min_samples: u32,
    /// Weight of a new sample once the offset is established
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub ema_alpha: f64,
    pub min_lead_time_us: u64,
    pub max_lead_time_us: u64,
    /// Lead time used before enough round trips were measured
    pub default_lead_time_us: u64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            window: 10,
            outlier_multiple: 2.0,
            outlier_floor_us: 1_000,
            confidence_window: 10,
            high_spread_us: 10_000,
            medium_spread_us: 20_000,
            min_samples: 2,
            ema_alpha: 0.1,
            min_lead_time_us: 15_000,
            max_lead_time_us: 100_000,
            default_lead_time_us: 50_000,
        }
    }
}

/// Cross-context queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ChannelConfig {
    #[validate(range(min = 1))]
    pub staging_capacity: usize,
    #[validate(range(min = 1))]
    pub deferred_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 16,
            deferred_capacity: 8,
        }
    }
}

/// Activation schedule and its scheduling task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ScheduleConfig {
    #[validate(range(min = 1))]
    pub capacity: usize,
    /// Busy-poll the clock once the deadline is this close
    pub spin_threshold_us: u64,
    /// Longest single cooperative sleep in the waiting state
    #[validate(range(min = 100))]
    pub max_sleep_us: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            spin_threshold_us: 2_000,
            max_sleep_us: 1_000,
        }
    }
}

/// Macrocycle batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MacrocycleConfig {
    #[validate(range(min = 1, max = 12))]
    pub max_events: usize,
    /// Burst length used by `add_event`
    #[validate(range(min = 1))]
    pub burst_duration_ms: u16,
    /// Converted deadlines further than this from now are dropped
    pub max_schedule_horizon_us: u64,
    /// Fingers per hand; events addressing others are skipped
    #[validate(range(min = 1, max = 8))]
    pub max_fingers: u8,
}

impl Default for MacrocycleConfig {
    fn default() -> Self {
        Self {
            max_events: MACROCYCLE_MAX_EVENTS,
            burst_duration_ms: 100,
            max_schedule_horizon_us: 30_000_000,
            max_fingers: 4,
        }
    }
}

/// Latency instrumentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LatencyConfig {
    pub enabled: bool,
    /// Log every firing with its drift
    pub verbose: bool,
    /// Drift above this counts as late
    pub late_threshold_us: u64,
    /// Acceptable bilateral alignment error for this deployment
    pub alignment_bound_us: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verbose: false,
            late_threshold_us: 1_000,
            alignment_bound_us: 10_000,
        }
    }
}

/// Simulated radio link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LinkConfig {
    /// Base one-way latency
    pub latency_us: u64,
    /// Uniform extra latency in `0..=jitter_us`
    pub jitter_us: u64,
    /// Probability that a frame is lost
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    pub loss_rate: f64,
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    /// Largest frame accepted by `send`
    #[validate(range(min = 20))]
    pub max_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency_us: 8_000,
            jitter_us: 3_000,
            loss_rate: 0.0,
            queue_capacity: 64,
            max_payload: 512,
        }
    }
}

/// Leader/follower simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SimulationConfig {
    #[validate(range(min = 1))]
    pub cycles: u32,
    /// Time between macrocycle commits
    #[validate(range(min = 10))]
    pub cycle_period_ms: u64,
    /// How far the follower's clock runs ahead of the leader's
    pub follower_clock_skew_us: u64,
    /// Main loop tick
    #[validate(range(min = 1))]
    pub tick_ms: u64,
    /// Keepalives exchanged before the first macrocycle
    pub warmup_pings: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cycles: 20,
            cycle_period_ms: 400,
            follower_clock_skew_us: 123_456,
            tick_ms: 1,
            warmup_pings: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keepalive.timeout_us(), 6_000_000);
        assert_eq!(config.macrocycle.max_events, 12);
    }

    #[test]
    fn test_range_violation_detected() {
        let mut config = NodeConfig::default();
        config.macrocycle.max_events = 13;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "keepalive": { "interval_ms": 500 } }"#).unwrap();
        assert_eq!(config.keepalive.interval_ms, 500);
        assert_eq!(config.keepalive.timeout_multiple, 6);
        assert_eq!(config.schedule.capacity, 32);
    }
}
