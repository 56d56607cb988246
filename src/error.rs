//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tunneling.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Wire length prefix out of range
    #[error("framing error: {0}")]
    Framing(String),

    /// Frame failed to decode or violated the tag/payload invariant
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Bad DATA index/CRC, unexpected tag, or oversized child payload
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Control connection was not established in time
    #[error("established timeout")]
    EstablishedTimeout,

    /// Too many unanswered pings
    #[error("ping pong timeout")]
    PingTimeout,

    /// Child connection saw no traffic for a full idle window
    #[error("conn idle timeout")]
    ConnIdleTimeout,

    /// The close flag was raised by a frame handler
    #[error("needclose")]
    NeedClose,

    /// Login rejected (bad key, duplicate name, role creation failure)
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// MaxClient/MaxSonny limit reached
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Channel closed while a pump still needed it
    #[error("channel closed")]
    ChannelClosed,

    /// Invalid configuration or unsupported transport
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new malformed frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFrame(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this error must tear down the whole control connection
    /// (rather than just the child stream it was raised on).
    pub fn is_fatal_to_control(&self) -> bool {
        matches!(
            self,
            Error::Framing(_)
                | Error::MalformedFrame(_)
                | Error::EstablishedTimeout
                | Error::PingTimeout
                | Error::AuthFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PingTimeout;
        assert_eq!(err.to_string(), "ping pong timeout");

        let err = Error::protocol("index error 3 4");
        assert_eq!(err.to_string(), "protocol violation: index error 3 4");
    }

    #[test]
    fn test_fatal_classes() {
        assert!(Error::Framing("len 0".into()).is_fatal_to_control());
        assert!(Error::PingTimeout.is_fatal_to_control());
        assert!(!Error::Protocol("crc".into()).is_fatal_to_control());
        assert!(!Error::ConnIdleTimeout.is_fatal_to_control());
    }
}
