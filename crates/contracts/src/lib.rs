//! # Contracts
//!
//! Frozen interface contracts shared by every crate in the workspace: motor
//! events, clock-offset and health types, collaborator traits (haptic
//! driver, transport, pattern source) and configuration.
//! Business crates depend on this crate only, never the other way round.
//!
//! ## Time Model
//! - Every timestamp is a `u64` count of microseconds since an arbitrary
//!   monotonic epoch local to the device that produced it
//! - Remote timestamps are converted with the current [`ClockOffset`]
//!   (`local = remote + offset`) before they are scheduled

mod clock;
mod config;
mod error;
mod event;
mod hardware;
mod health;
mod latency;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use hardware::*;
pub use health::ConnectionHealth;
pub use latency::*;
