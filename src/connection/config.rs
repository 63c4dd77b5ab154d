//! Per-connection tunables.

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Settings applied when a connection is dialed or wrapped.
///
/// Every field has a default; setters follow the builder style so a config
/// can be written inline:
///
/// ```
/// use std::time::Duration;
/// use natwire::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .dial_timeout(Duration::from_secs(1))
///     .max_payload_size(1024 * 1024);
/// assert_eq!(config.ping_timeout, ConnectionConfig::DEFAULT_PING_TIMEOUT);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on establishing the TCP connection.
    pub dial_timeout: Duration,
    /// Upper bound on the server acknowledging `CONNECT`.
    pub handshake_timeout: Duration,
    /// How long `ping` waits for the matching `PONG`.
    pub ping_timeout: Duration,
    /// Largest inbound `MSG` payload accepted by the read loop.
    pub max_payload_size: usize,
    /// Frames that may be queued for the writer task.
    pub write_channel_capacity: usize,
    /// Capacity of the buffered reader under the read loop.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(500);
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn write_channel_capacity(mut self, capacity: usize) -> Self {
        self.write_channel_capacity = capacity;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Self::DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            ping_timeout: Self::DEFAULT_PING_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            write_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_buffer_size: Self::DEFAULT_READ_BUFFER_SIZE,
        }
    }
}
