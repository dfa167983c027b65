//! # Link
//!
//! 模拟的尽力而为无线链路。
//!
//! 负责：
//! - 以 `Transport` 形式接收发送帧（从不阻塞）
//! - 按配置注入延迟、抖动与丢包
//! - 在独立的工作任务中把字节交给 `ByteSink`（异步到达上下文）
//! - 慢接收端只会导致丢帧，不会阻塞发送方

pub mod error;
pub mod metrics;
mod simulated;

pub use contracts::{ByteSink, LinkConfig, Transport};
pub use error::LinkError;
pub use metrics::{LinkMetrics, MetricsSnapshot};
pub use simulated::{link_pair, LinkTransport, SimulatedLink};
