//! Configuration for channel adapters and sessions.

use std::fmt;
use std::time::Duration;

/// Shortest write wait, pong wait and ping period the transport runs with.
pub const MIN_WAIT: Duration = Duration::from_millis(1);

/// Timing and size limits of the WebSocket transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsConfig {
    /// Time allowed to write one frame to the peer.
    pub write_wait: Duration,
    /// Time allowed between two inbound frames before the peer is considered dead.
    pub pong_wait: Duration,
    /// Interval between pings. Must be less than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self::default_with_pong_wait(Duration::from_secs(60))
    }
}

impl WsConfig {
    fn default_with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 1024,
        }
    }

    /// Set the write deadline. Values below [`MIN_WAIT`] are raised to it.
    pub fn with_write_wait(mut self, write_wait: Duration) -> Self {
        self.write_wait = write_wait.max(MIN_WAIT);
        self
    }

    /// Set the pong wait. The ping period follows at nine tenths of it.
    /// Both are raised to at least [`MIN_WAIT`].
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait.max(MIN_WAIT);
        self.ping_period = (self.pong_wait * 9 / 10).max(MIN_WAIT);
        self
    }

    /// Set the inbound frame size limit.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

/// Behaviour shared by every adapter type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Log every message read from or written to the adapter.
    pub read_write_logging: bool,
}

impl AdapterConfig {
    pub fn with_read_write_logging(mut self, enabled: bool) -> Self {
        self.read_write_logging = enabled;
        self
    }
}

/// Transport backing a channel adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdapterType {
    #[default]
    WebSocket,
    /// In-memory adapter used by tests. Cannot be dialed or listened on.
    Mock,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::Mock => f.write_str("mock"),
        }
    }
}

/// Configuration of a channel session: adapter type, transport limits and
/// the number of identity-verified connections that may wait for pickup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub adapter_type: AdapterType,
    pub ws: WsConfig,
    pub adapter: AdapterConfig,
    /// Capacity of the inbound channel queue.
    pub max_conn: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adapter_type: AdapterType::WebSocket,
            ws: WsConfig::default(),
            adapter: AdapterConfig::default(),
            max_conn: 100,
        }
    }
}

impl SessionConfig {
    pub fn with_adapter_type(mut self, adapter_type: AdapterType) -> Self {
        self.adapter_type = adapter_type;
        self
    }

    pub fn with_ws(mut self, ws: WsConfig) -> Self {
        self.ws = ws;
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterConfig) -> Self {
        self.adapter = adapter;
        self
    }

    /// Set the inbound queue capacity. Zero is raised to one.
    pub fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_defaults() {
        let config = WsConfig::default();
        assert_eq!(config.write_wait, Duration::from_secs(10));
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn ping_period_follows_pong_wait() {
        let config = WsConfig::default().with_pong_wait(Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(9));
        assert!(config.ping_period < config.pong_wait);
    }

    #[test]
    fn zero_waits_are_raised() {
        let config = WsConfig::default()
            .with_pong_wait(Duration::ZERO)
            .with_write_wait(Duration::ZERO);
        assert_eq!(config.pong_wait, MIN_WAIT);
        assert_eq!(config.ping_period, MIN_WAIT);
        assert_eq!(config.write_wait, MIN_WAIT);
    }

    #[test]
    fn session_builder() {
        let config = SessionConfig::default()
            .with_max_conn(0)
            .with_adapter(AdapterConfig::default().with_read_write_logging(true));
        assert_eq!(config.max_conn, 1);
        assert!(config.adapter.read_write_logging);
        assert_eq!(config.adapter_type, AdapterType::WebSocket);
    }
}
