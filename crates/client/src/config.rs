//! Configuration for transport connections and session lifecycle.

use std::time::Duration;

/// Configuration for reconnect and heartbeat behavior of one transport
/// connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Maximum number of automatic reconnect attempts after an unexpected
    /// close. Exceeding the cap leaves the connection disconnected.
    pub max_reconnect_attempts: u32,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Backoff delay for a given 1-based attempt number:
    /// `reconnect_delay * 2^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.reconnect_delay.saturating_mul(factor)
    }
}

/// Configuration for session refresh scheduling and inactivity tracking.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long before expiry the silent refresh fires.
    pub auto_refresh_buffer: Duration,
    /// How long without recorded activity before `session-inactive` fires.
    pub max_inactivity: Duration,
    /// Expiry horizon assumed when the provider does not report one.
    pub fallback_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_refresh_buffer: Duration::from_secs(5 * 60),
            max_inactivity: Duration::from_secs(30 * 60),
            fallback_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}
