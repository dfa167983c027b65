//! # Sync Engine
//!
//! 双手触觉设备的主从同步核心。
//!
//! 负责：
//! - 基于保活往返的时钟偏移估计（`clock_sync`）
//! - 宏周期线路协议编解码（`protocol`）
//! - 到达上下文与主循环之间的有界通道（`channel` / `deferred`）
//! - 按截止时间执行马达事件的调度任务（`scheduler`）
//! - 主节点 / 从节点协调与连接健康监测（`coordinator`）
//!
//! ## 使用示例
//!
//! ```ignore
//! use sync_engine::{FollowerCoordinator, NodeConfig};
//!
//! let (mut follower, arrival) =
//!     FollowerCoordinator::new(&NodeConfig::default(), clock, transport, driver);
//! link.attach(arrival);
//!
//! loop {
//!     let health = follower.tick().await;
//!     if follower.is_stopped() {
//!         break;
//!     }
//! }
//! ```

mod channel;
mod clock_sync;
mod coordinator;
mod deferred;
mod error;
mod latency;
pub mod mock;
mod protocol;
mod schedule;
mod scheduler;

pub use channel::{event_channel, ChannelStats, StagingConsumer, StagingProducer};
pub use clock_sync::{ClockSyncEstimator, EstimatorStats, RoundTrip, SampleVerdict};
pub use coordinator::{
    ArrivalHandler, ArrivalStats, BatchHandle, FollowerCoordinator, HealthMonitor,
    LeaderCoordinator, NodeStats, Role, TEST_PULSE_FREQUENCY_HZ,
};
pub use deferred::{deferred_queue, DeferredConsumer, DeferredExecutor, DeferredProducer, DeferredWork};
pub use error::SyncError;
pub use latency::LatencyInstrumentation;
pub use protocol::{
    seq_is_newer, Framer, Macrocycle, MacrocycleEvent, Message, FLAG_LAST, FRAME_TERMINATOR,
    MAX_FRAME_LEN, RESTART_WINDOW,
};
pub use schedule::ActivationSchedule;
pub use scheduler::{
    plan, ActivationScheduler, SchedulerCommand, SchedulerHandle, SchedulerState, SchedulerStats,
};

// Re-export contracts types
pub use contracts::{
    ClockOffset, Confidence, ConnectionHealth, LatencySnapshot, MotorEvent, NodeConfig,
    StagedEvent,
};
