//! Two-way (PTP-style) clock offset estimation.
//!
//! Every keepalive exchange yields four timestamps: `t1`/`t4` on the
//! initiating (leader) clock, `t2`/`t3` on the peer (follower) clock. The
//! estimate is `peer - initiator`, so a follower converts a leader deadline
//! with `local = remote + offset`.
//!
//! Samples whose one-way delay is well above the recent minimum are treated
//! as congestion/retransmission artifacts and never reach the offset.

use std::collections::VecDeque;

use contracts::{ClockOffset, ClockSyncConfig, Confidence};

/// Samples at least this far apart (ms) feed the drift-rate estimate
const DRIFT_MIN_INTERVAL_MS: f64 = 100.0;
const DRIFT_ALPHA: f64 = 0.3;
/// Smoothing of the RTT mean/deviation used for the lead time
const RTT_GAIN: f64 = 0.125;
const RTT_DEV_GAIN: f64 = 0.25;

/// Timestamps of one completed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    /// Initiator send
    pub t1: u64,
    /// Peer receive
    pub t2: u64,
    /// Peer send
    pub t3: u64,
    /// Initiator receive
    pub t4: u64,
}

impl RoundTrip {
    pub fn new(t1: u64, t2: u64, t3: u64, t4: u64) -> Self {
        Self { t1, t2, t3, t4 }
    }

    /// `((t2 - t1) + (t3 - t4)) / 2`, truncated toward zero
    pub fn offset_us(&self) -> i64 {
        let forward = self.t2 as i64 - self.t1 as i64;
        let reverse = self.t3 as i64 - self.t4 as i64;
        (forward + reverse) / 2
    }

    /// Network round trip, peer processing excluded
    pub fn rtt_us(&self) -> i64 {
        (self.t4 as i64 - self.t1 as i64) - (self.t3 as i64 - self.t2 as i64)
    }

    pub fn delay_us(&self) -> i64 {
        self.rtt_us() / 2
    }
}

/// What happened to a recorded sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleVerdict {
    Accepted { offset_us: i64, delay_us: u64 },
    /// Delay too far above the window minimum
    Outlier { delay_us: u64, min_delay_us: u64 },
    /// Timestamps inconsistent (negative round trip or peer processing time)
    Invalid,
}

impl SampleVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimatorStats {
    pub observed: u32,
    pub accepted: u32,
    pub outliers: u32,
    pub invalid: u32,
}

/// Maintains the offset between the local clock and the peer clock
#[derive(Debug, Clone)]
pub struct ClockSyncEstimator {
    config: ClockSyncConfig,
    /// Delays of the last `window` valid samples, accepted or not
    delays: VecDeque<u64>,
    /// Offsets of the last `window` accepted samples
    offsets: VecDeque<i64>,
    /// RTTs of the last `confidence_window` accepted samples
    rtts: VecDeque<u64>,
    estimate_us: i64,
    established: bool,
    stats: EstimatorStats,
    smoothed_rtt_us: f64,
    rtt_dev_us: f64,
    last_sample: Option<(u64, i64)>,
    drift_us_per_ms: f64,
}

impl ClockSyncEstimator {
    pub fn new(config: ClockSyncConfig) -> Self {
        let window = config.window.max(1);
        let confidence_window = config.confidence_window.max(2);
        Self {
            delays: VecDeque::with_capacity(window),
            offsets: VecDeque::with_capacity(window),
            rtts: VecDeque::with_capacity(confidence_window),
            config,
            estimate_us: 0,
            established: false,
            stats: EstimatorStats::default(),
            smoothed_rtt_us: 0.0,
            rtt_dev_us: 0.0,
            last_sample: None,
            drift_us_per_ms: 0.0,
        }
    }

    /// Feed one completed exchange
    pub fn record_round_trip(&mut self, t1: u64, t2: u64, t3: u64, t4: u64) -> SampleVerdict {
        self.record(RoundTrip::new(t1, t2, t3, t4))
    }

    pub fn record(&mut self, sample: RoundTrip) -> SampleVerdict {
        if sample.t3 < sample.t2 || sample.rtt_us() < 0 {
            self.stats.invalid += 1;
            return SampleVerdict::Invalid;
        }

        let rtt = sample.rtt_us() as u64;
        let delay = rtt / 2;
        let window_min = self.delays.iter().copied().min();

        push_bounded(&mut self.delays, delay, self.config.window);
        self.stats.observed += 1;

        if let Some(min_delay) = window_min {
            let limit = (min_delay as f64 * self.config.outlier_multiple) as u64;
            if delay > self.config.outlier_floor_us && delay > limit {
                self.stats.outliers += 1;
                return SampleVerdict::Outlier {
                    delay_us: delay,
                    min_delay_us: min_delay,
                };
            }
        }

        let offset = sample.offset_us();
        self.accept(offset, rtt, sample.t1);
        SampleVerdict::Accepted {
            offset_us: offset,
            delay_us: delay,
        }
    }

    fn accept(&mut self, offset: i64, rtt: u64, at_us: u64) {
        self.stats.accepted += 1;
        push_bounded(&mut self.offsets, offset, self.config.window);
        push_bounded(&mut self.rtts, rtt, self.config.confidence_window);
        self.update_rtt_smoothing(rtt);

        if self.established {
            self.update_drift(offset, at_us);
            let delta = (offset - self.estimate_us) as f64 * self.config.ema_alpha;
            self.estimate_us += delta.round() as i64;
        } else {
            self.estimate_us = median(&self.offsets);
            self.established = self.stats.accepted >= self.config.min_samples;
        }
        self.last_sample = Some((at_us, offset));
    }

    fn update_rtt_smoothing(&mut self, rtt: u64) {
        let rtt = rtt as f64;
        if self.stats.accepted == 1 {
            self.smoothed_rtt_us = rtt;
            self.rtt_dev_us = rtt / 2.0;
        } else {
            self.rtt_dev_us += RTT_DEV_GAIN * ((rtt - self.smoothed_rtt_us).abs() - self.rtt_dev_us);
            self.smoothed_rtt_us += RTT_GAIN * (rtt - self.smoothed_rtt_us);
        }
    }

    fn update_drift(&mut self, offset: i64, at_us: u64) {
        let Some((last_at, last_offset)) = self.last_sample else {
            return;
        };
        let elapsed_ms = at_us.saturating_sub(last_at) as f64 / 1_000.0;
        if elapsed_ms >= DRIFT_MIN_INTERVAL_MS {
            let rate = (offset - last_offset) as f64 / elapsed_ms;
            self.drift_us_per_ms = DRIFT_ALPHA * rate + (1.0 - DRIFT_ALPHA) * self.drift_us_per_ms;
        }
    }

    /// Current estimate; zero with `Low` confidence until enough samples exist
    pub fn current_offset(&self) -> ClockOffset {
        if self.stats.observed < self.config.min_samples || self.stats.accepted == 0 {
            return ClockOffset {
                value_us: 0,
                confidence: Confidence::Low,
                sample_count: self.stats.accepted,
            };
        }

        ClockOffset {
            value_us: self.estimate_us,
            confidence: self.confidence(),
            sample_count: self.stats.accepted,
        }
    }

    fn confidence(&self) -> Confidence {
        if self.rtts.len() < 2 {
            return Confidence::Low;
        }
        Confidence::from_spread(
            self.rtt_spread_us(),
            self.config.high_spread_us,
            self.config.medium_spread_us,
        )
    }

    /// `max - min` of the accepted RTT window
    pub fn rtt_spread_us(&self) -> u64 {
        let max = self.rtts.iter().copied().max().unwrap_or(0);
        let min = self.rtts.iter().copied().min().unwrap_or(0);
        max - min
    }

    /// Convert a peer timestamp into the local clock
    pub fn to_local_time(&self, remote_us: u64) -> u64 {
        self.current_offset().apply(remote_us)
    }

    /// Offset extrapolated with the drift rate to `at_us` (initiator clock)
    pub fn projected_offset(&self, at_us: u64) -> i64 {
        let offset = self.current_offset().value_us;
        match self.last_sample {
            Some((last_at, _)) if self.established => {
                let elapsed_ms = at_us.saturating_sub(last_at) as f64 / 1_000.0;
                offset + (self.drift_us_per_ms * elapsed_ms).round() as i64
            }
            _ => offset,
        }
    }

    pub fn drift_rate_us_per_ms(&self) -> f64 {
        self.drift_us_per_ms
    }

    /// Lead between commit and execution of a macrocycle
    ///
    /// `smoothed RTT + 3 * deviation`, clamped to the configured bounds.
    pub fn adaptive_lead_time_us(&self) -> u64 {
        if self.stats.accepted < self.config.min_samples {
            return self.config.default_lead_time_us;
        }
        let lead = (self.smoothed_rtt_us + 3.0 * self.rtt_dev_us).round() as u64;
        lead.clamp(self.config.min_lead_time_us, self.config.max_lead_time_us)
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn stats(&self) -> EstimatorStats {
        self.stats
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    if window.len() >= cap.max(1) {
        window.pop_front();
    }
    window.push_back(value);
}

fn median(values: &VecDeque<i64>) -> i64 {
    let mut sorted: Vec<i64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => 0,
        n if n % 2 == 0 => (sorted[mid - 1] + sorted[mid]) / 2,
        _ => sorted[mid],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> ClockSyncEstimator {
        ClockSyncEstimator::new(ClockSyncConfig::default())
    }

    /// Exchange with symmetric one-way `delay_us` against a peer `offset_us` ahead
    fn exchange(t1: u64, delay_us: u64, offset_us: u64) -> RoundTrip {
        let t2 = t1 + delay_us + offset_us;
        let t3 = t2 + 50;
        let t4 = t3 - offset_us + delay_us;
        RoundTrip::new(t1, t2, t3, t4)
    }

    #[test]
    fn test_four_timestamp_formula() {
        let rt = RoundTrip::new(1_000, 1_000, 1_010, 1_025);
        assert_eq!(rt.rtt_us(), 15);
        assert_eq!(rt.offset_us(), -7);
        assert_eq!(rt.delay_us(), 7);
    }

    #[test]
    fn test_no_samples_fails_open() {
        let est = estimator();
        let offset = est.current_offset();
        assert_eq!(offset.value_us, 0);
        assert_eq!(offset.confidence, Confidence::Low);
        assert_eq!(est.to_local_time(5_000), 5_000);
    }

    #[test]
    fn test_single_sample_is_not_trusted() {
        let mut est = estimator();
        est.record(exchange(0, 5_000, 200_000));
        assert_eq!(est.current_offset().value_us, 0);
        assert_eq!(est.current_offset().confidence, Confidence::Low);
    }

    #[test]
    fn test_symmetric_delay_cancels() {
        let mut est = estimator();
        est.record(exchange(0, 5_000, 200_000));
        est.record(exchange(1_000_000, 6_000, 200_000));

        let offset = est.current_offset();
        assert_eq!(offset.value_us, 200_000);
        assert_eq!(offset.sample_count, 2);
        assert_eq!(est.to_local_time(1_000), 201_000);
    }

    #[test]
    fn test_delay_outlier_rejected() {
        let mut est = estimator();
        let good = exchange(0, 15_000, 50_000);
        // 40ms one-way delay with a skewed offset reading
        let bad = RoundTrip::new(1_000_000, 1_100_000, 1_100_100, 1_080_100);
        assert_eq!(bad.delay_us(), 40_000);

        assert!(est.record(good).is_accepted());
        let verdict = est.record(bad);

        assert_eq!(
            verdict,
            SampleVerdict::Outlier {
                delay_us: 40_000,
                min_delay_us: 15_000
            }
        );
        assert_eq!(est.current_offset().value_us, good.offset_us());
        assert_eq!(est.current_offset().sample_count, 1);
    }

    #[test]
    fn test_outlier_never_lowers_confidence() {
        let mut est = estimator();
        for i in 0..5 {
            est.record(exchange(i * 1_000_000, 4_000 + i * 100, 10_000));
        }
        let before = est.current_offset();
        assert_eq!(before.confidence, Confidence::High);

        let verdict = est.record(exchange(9_000_000, 60_000, 10_000));
        assert!(!verdict.is_accepted());
        assert_eq!(est.current_offset(), before);
    }

    #[test]
    fn test_window_recovers_after_sustained_degradation() {
        let mut est = estimator();
        est.record(exchange(0, 2_000, 0));
        let mut accepted_later = false;
        for i in 1..=12 {
            if est.record(exchange(i * 1_000_000, 10_000, 0)).is_accepted() {
                accepted_later = true;
            }
        }
        assert!(accepted_later);
    }

    #[test]
    fn test_confidence_from_rtt_spread() {
        let mut est = estimator();
        est.record(exchange(0, 5_000, 0));
        est.record(exchange(1_000_000, 9_000, 0));
        // spread 8ms
        assert_eq!(est.current_offset().confidence, Confidence::High);

        est.record(exchange(2_000_000, 10_000, 0));
        // spread 10ms
        assert_eq!(est.current_offset().confidence, Confidence::Medium);
    }

    #[test]
    fn test_invalid_timestamps_ignored() {
        let mut est = estimator();
        assert_eq!(
            est.record_round_trip(1_000, 2_000, 1_500, 3_000),
            SampleVerdict::Invalid
        );
        assert_eq!(est.stats().invalid, 1);
        assert_eq!(est.stats().observed, 0);
    }

    #[test]
    fn test_ema_after_establishment() {
        let mut est = estimator();
        est.record(exchange(0, 5_000, 1_000));
        est.record(exchange(1_000_000, 5_000, 1_000));
        assert!(est.is_established());

        est.record(exchange(2_000_000, 5_000, 2_000));
        // 1000 + 0.1 * (2000 - 1000)
        assert_eq!(est.current_offset().value_us, 1_100);
        assert!(est.drift_rate_us_per_ms() > 0.0);
        assert!(est.projected_offset(3_000_000) > 1_100);
    }

    #[test]
    fn test_adaptive_lead_time_clamped() {
        let mut est = estimator();
        assert_eq!(est.adaptive_lead_time_us(), 50_000);

        est.record(exchange(0, 1_000, 0));
        est.record(exchange(1_000_000, 1_000, 0));
        assert_eq!(est.adaptive_lead_time_us(), 15_000);
    }
}
