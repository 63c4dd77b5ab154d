//! Error types for natwire.

use thiserror::Error;

/// Main error type for all natwire operations.
#[derive(Debug, Error)]
pub enum NatwireError {
    /// I/O error while dialing, reading, or writing the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (connect credentials only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dialing the broker did not complete in time.
    #[error("Timed out dialing {0}")]
    DialTimeout(String),

    /// The server did not acknowledge `CONNECT` in time.
    #[error("Timed out waiting for handshake acknowledgment")]
    HandshakeTimeout,

    /// Negative acknowledgment from the server, message kept verbatim.
    #[error("{0}")]
    Protocol(String),

    /// No keyword token before the end of the control line.
    #[error("Malformed header: no frame keyword")]
    MalformedHeader,

    /// Keyword does not name any known frame.
    #[error("Unknown frame kind: {0}")]
    UnknownFrameKind(String),

    /// Frame contents violate the framing rules.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Peer closed the stream.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection (or client) is no longer serving.
    #[error("disconnected")]
    Disconnected,

    /// A cluster provider was configured without members.
    #[error("No candidate endpoints configured")]
    NoCandidates,
}

impl NatwireError {
    /// Whether this error came from the server rejecting a control frame.
    ///
    /// Protocol errors leave the connection usable; everything else is
    /// fatal to the connection that produced it.
    pub fn is_protocol(&self) -> bool {
        matches!(self, NatwireError::Protocol(_))
    }
}

/// Result type alias using NatwireError.
pub type Result<T> = std::result::Result<T, NatwireError>;
