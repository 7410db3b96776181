//! Connection-level options for the realtime client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::RetryPolicy;

/// Tuning knobs for the realtime connection: reconnection backoff, the
/// handshake deadline, and the keepalive cadence.
///
/// # Example
///
/// ```rust
/// use recall_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_auto_reconnect(true)
///     .with_reconnect_delay_ms(2000)
///     .with_max_reconnect_attempts(10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Reconnect automatically after an abnormal connection loss.
    /// Defaults to `true`.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Wait before the first reconnection attempt, in milliseconds; the
    /// wait doubles per attempt up to `max_reconnect_delay_ms`.
    /// Defaults to 1 second.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Ceiling on the backoff delay, in milliseconds. Defaults to 30 seconds.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Reconnection attempts allowed before the client settles in ERROR
    /// and waits for a fresh `connect()`. Defaults to 5.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Deadline for the WebSocket handshake, in milliseconds, applied to
    /// the initial connect and every reconnect. Defaults to 10 seconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Keepalive cadence, in milliseconds.
    ///
    /// While connected the client emits a JSON `PING` envelope at this
    /// interval so intermediary proxies do not idle the socket out.
    /// `0` disables the heartbeat. Defaults to 30 seconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl ConnectionOptions {
    /// Options with every knob at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle automatic reconnection after abnormal connection loss.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Wait before the first reconnection attempt, in milliseconds.
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Ceiling on the backoff delay, in milliseconds.
    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    /// Reconnection attempts allowed before settling in ERROR.
    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Deadline for the WebSocket handshake, in milliseconds.
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Keepalive cadence in milliseconds; `0` disables the heartbeat.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// The backoff policy these options describe.
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Heartbeat interval, or `None` when disabled.
    pub(crate) fn heartbeat_interval(&self) -> Option<Duration> {
        if self.heartbeat_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.heartbeat_interval_ms))
        }
    }
}
