//! Link health as seen by keepalive monitoring

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection health derived from time since the last peer traffic
///
/// `Lost` is only entered after the keepalive timeout elapses and is left
/// again as soon as traffic resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    #[default]
    Connected,
    /// Whole keepalive intervals elapsed without traffic
    KeepaliveMissed(u32),
    Lost,
}

impl ConnectionHealth {
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost)
    }

    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::KeepaliveMissed(_) => "keepalive_missed",
            Self::Lost => "lost",
        }
    }
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepaliveMissed(n) => write!(f, "keepalive_missed({n})"),
            other => f.write_str(other.label()),
        }
    }
}
