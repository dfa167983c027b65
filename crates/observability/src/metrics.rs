//! 同步会话指标收集模块
//!
//! 所有指标均以 `haptic_sync_` 为前缀，只在主循环上下文中调用，
//! 从不在到达上下文或触发路径中调用。

use contracts::{ClockOffset, ConnectionHealth, LatencySnapshot};
use metrics::{counter, gauge, histogram};

/// 记录连接健康状态变化
pub fn record_health_transition(role: &'static str, health: ConnectionHealth) {
    counter!(
        "haptic_sync_health_transitions_total",
        "role" => role,
        "health" => health.label()
    )
    .increment(1);

    let level = match health {
        ConnectionHealth::Connected => 0.0,
        ConnectionHealth::KeepaliveMissed(n) => f64::from(n),
        ConnectionHealth::Lost => -1.0,
    };
    gauge!("haptic_sync_health", "role" => role).set(level);
}

/// 记录当前时钟偏移估计及其置信度
pub fn record_clock_offset(role: &'static str, offset: &ClockOffset) {
    gauge!("haptic_sync_clock_offset_us", "role" => role).set(offset.value_us as f64);
    gauge!("haptic_sync_clock_confidence", "role" => role).set(f64::from(offset.confidence as u8));
    gauge!("haptic_sync_clock_samples", "role" => role).set(f64::from(offset.sample_count));
}

/// 记录延迟快照 (会话结束时调用)
pub fn record_latency_snapshot(role: &'static str, snapshot: &LatencySnapshot) {
    if !snapshot.enabled {
        return;
    }

    let drift = &snapshot.drift;
    gauge!("haptic_sync_drift_mean_us", "role" => role).set(drift.mean_us);
    gauge!("haptic_sync_drift_max_us", "role" => role).set(drift.max_us as f64);
    gauge!("haptic_sync_drift_jitter_us", "role" => role).set(drift.jitter_us as f64);
    gauge!("haptic_sync_late_fraction", "role" => role).set(drift.late_fraction);
    counter!("haptic_sync_late_activations_total", "role" => role).increment(drift.late_count);

    let rtt = &snapshot.rtt;
    if rtt.count > 0 {
        gauge!("haptic_sync_rtt_mean_us", "role" => role).set(rtt.mean_us);
        gauge!("haptic_sync_rtt_spread_us", "role" => role).set(rtt.spread_us as f64);
    }

    record_clock_offset(role, &snapshot.offset);
}

/// 记录一对主从激活的对齐误差
pub fn record_alignment_error_us(error_us: i64) {
    histogram!("haptic_sync_alignment_error_us").record(error_us.unsigned_abs() as f64);
}

/// 记录链路丢帧 (会话结束时按原因汇总)
pub fn record_link_drops(link: &str, reason: &'static str, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        "haptic_sync_link_frames_dropped_total",
        "link" => link.to_string(),
        "reason" => reason
    )
    .increment(count);
}

/// 双侧对齐聚合器
///
/// 在内存中聚合主从两侧同一事件的实际触发时间差，便于输出会话摘要。
#[derive(Debug, Clone, Default)]
pub struct AlignmentAggregator {
    /// 可接受的对齐误差上限 (微秒)
    bound_us: u64,

    /// 有符号误差统计 (从 - 主)
    error_stats: RunningStats,

    /// 误差绝对值最大值
    max_abs_us: u64,

    /// 超出上限的对数
    over_bound: u64,

    /// 只在一侧触发的事件数
    unmatched: u64,
}

impl AlignmentAggregator {
    /// 创建新的聚合器
    pub fn new(bound_us: u64) -> Self {
        Self {
            bound_us,
            ..Default::default()
        }
    }

    /// 记录一对匹配事件的误差
    pub fn push(&mut self, error_us: i64) {
        self.error_stats.push(error_us as f64);
        let abs = error_us.unsigned_abs();
        self.max_abs_us = self.max_abs_us.max(abs);
        if abs > self.bound_us {
            self.over_bound += 1;
        }
        record_alignment_error_us(error_us);
    }

    /// 记录未匹配事件
    pub fn add_unmatched(&mut self, count: u64) {
        self.unmatched += count;
    }

    /// 生成摘要报告
    pub fn summary(&self) -> AlignmentSummary {
        let pairs = self.error_stats.count();
        AlignmentSummary {
            pairs,
            unmatched: self.unmatched,
            bound_us: self.bound_us,
            over_bound: self.over_bound,
            max_abs_us: self.max_abs_us,
            within_bound_rate: if pairs > 0 {
                (pairs - self.over_bound) as f64 / pairs as f64 * 100.0
            } else {
                0.0
            },
            error_us: StatsSummary::from(&self.error_stats),
        }
    }

    /// 重置统计
    pub fn reset(&mut self) {
        *self = Self::new(self.bound_us);
    }
}

/// 对齐摘要
#[derive(Debug, Clone, Default)]
pub struct AlignmentSummary {
    pub pairs: u64,
    pub unmatched: u64,
    pub bound_us: u64,
    pub over_bound: u64,
    pub max_abs_us: u64,
    pub within_bound_rate: f64,
    pub error_us: StatsSummary,
}

impl AlignmentSummary {
    /// 所有匹配对都在上限之内 (且至少有一对)
    pub fn is_within_bound(&self) -> bool {
        self.pairs > 0 && self.over_bound == 0
    }
}

impl std::fmt::Display for AlignmentSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bilateral Alignment ===")?;
        writeln!(f, "Matched pairs: {}", self.pairs)?;
        writeln!(f, "Unmatched events: {}", self.unmatched)?;
        writeln!(f, "Error (us): {}", self.error_us)?;
        writeln!(f, "Max |error|: {} us", self.max_abs_us)?;
        writeln!(
            f,
            "Within {} us: {:.2}% ({} over)",
            self.bound_us, self.within_bound_rate, self.over_bound
        )
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.1}, max={:.1}, mean={:.1}, std={:.1} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
