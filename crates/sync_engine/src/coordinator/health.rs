//! Keepalive-based connection health

use contracts::{ConnectionHealth, KeepaliveConfig};

/// Derives [`ConnectionHealth`] from the time since the last received traffic
///
/// Silence of `n` whole intervals reports `KeepaliveMissed(n)`; silence
/// strictly longer than `interval * timeout_multiple` reports `Lost`. `Lost`
/// is latched until traffic arrives again.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval_us: u64,
    timeout_us: u64,
    last_traffic_us: u64,
    health: ConnectionHealth,
}

impl HealthMonitor {
    /// Start `Connected`, counting silence from `now_us`
    pub fn new(config: &KeepaliveConfig, now_us: u64) -> Self {
        Self {
            interval_us: config.interval_us().max(1),
            timeout_us: config.timeout_us(),
            last_traffic_us: now_us,
            health: ConnectionHealth::Connected,
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    pub fn last_traffic_us(&self) -> u64 {
        self.last_traffic_us
    }

    pub fn silence_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.last_traffic_us)
    }

    /// Any message from the peer; returns the new state if it changed
    pub fn record_traffic(&mut self, now_us: u64) -> Option<ConnectionHealth> {
        self.last_traffic_us = self.last_traffic_us.max(now_us);
        self.transition(ConnectionHealth::Connected)
    }

    /// Re-derive health at `now_us`; returns the new state if it changed
    pub fn evaluate(&mut self, now_us: u64) -> Option<ConnectionHealth> {
        if self.health.is_lost() {
            return None;
        }
        let silence = self.silence_us(now_us);
        let next = if silence > self.timeout_us {
            ConnectionHealth::Lost
        } else {
            match (silence / self.interval_us) as u32 {
                0 => ConnectionHealth::Connected,
                missed => ConnectionHealth::KeepaliveMissed(missed),
            }
        };
        self.transition(next)
    }

    fn transition(&mut self, next: ConnectionHealth) -> Option<ConnectionHealth> {
        if next == self.health {
            return None;
        }
        self.health = next;
        Some(next)
    }
}
