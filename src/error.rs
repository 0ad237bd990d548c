//! Error types for the relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the relay.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed (sealing, or authentication on open)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Key exchange with the peer failed
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Invalid bind or server address
    #[error("invalid address: {0}")]
    Address(String),

    /// Event table is at capacity
    #[error("event table full ({0} slots)")]
    Capacity(usize),

    /// A file descriptor was registered twice
    #[error("fd {0} is already registered")]
    DuplicateFd(i32),

    /// A file descriptor was not found in the event table
    #[error("fd {0} is not registered")]
    UnknownFd(i32),

    /// Readiness reported for a closed or corrupt table slot
    #[error("stale event table entry for fd {0}")]
    StaleEntry(i32),

    /// The listening socket itself failed; fatal to the run loop
    #[error("listener failure: {0}")]
    Listener(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new address error
    pub fn address(msg: impl Into<String>) -> Self {
        Error::Address(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Capacity(512);
        assert_eq!(err.to_string(), "event table full (512 slots)");

        let err = Error::DuplicateFd(7);
        assert_eq!(err.to_string(), "fd 7 is already registered");

        let err = Error::config("bad port");
        assert_eq!(err.to_string(), "configuration error: bad port");
    }
}
