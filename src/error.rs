//! Error types for floodnet
//!
//! Errors are grouped by subsystem and folded into [`FloodnetError`] through
//! `From` conversions, so `?` works across module boundaries.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::protocol::ProtocolError;

/// Main error type for floodnet operations
#[derive(Error, Debug)]
pub enum FloodnetError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Peer table errors
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not allowed in the node's current lifecycle state
    #[error("Cannot {operation} while node is {state}")]
    InvalidState {
        /// What was attempted
        operation: &'static str,
        /// Lifecycle state at the time
        state: &'static str,
    },
}

/// Transport-level failures
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Could not bind a listening socket
    #[error("Failed to bind {address}: {reason}")]
    BindFailed {
        /// Address we tried to bind
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Could not reach a remote endpoint
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Remote address
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Writing to a peer failed
    #[error("Send to {address} failed: {reason}")]
    SendFailed {
        /// Remote address
        address: SocketAddr,
        /// Underlying cause
        reason: String,
    },

    /// Reading from a peer failed
    #[error("Receive failed: {reason}")]
    ReceiveFailed {
        /// Underlying cause
        reason: String,
    },

    /// Peer closed the stream mid-message
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// Incoming message exceeded the size cap
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Bytes received so far
        size: usize,
        /// Configured cap
        max: usize,
    },

    /// Peer did not answer in time
    #[error("Timed out waiting for {address}")]
    Timeout {
        /// Remote address
        address: String,
    },

    /// Address could not be resolved or parsed
    #[error("Invalid address: {address}")]
    InvalidAddress {
        /// Offending address text
        address: String,
    },

    /// Remote side answered with an error status
    #[error("Remote error {code}: {reason}")]
    RemoteError {
        /// Error code from the reply
        code: i64,
        /// Reason text from the reply
        reason: String,
    },
}

/// Configuration problems
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric setting was zero or out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Setting name
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Config file could not be read
    #[error("Cannot read config file {path}: {reason}")]
    Unreadable {
        /// File path
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// Config file is not valid TOML for our schema
    #[error("Cannot parse config file {path}: {reason}")]
    Unparseable {
        /// File path
        path: PathBuf,
        /// Parser message
        reason: String,
    },
}

/// Peer table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No registration for this address
    #[error("Peer not found: {address}")]
    PeerNotFound {
        /// Address that was looked up
        address: SocketAddr,
    },

    /// Port text is not an integer in 0..=65535
    #[error("Invalid port: {port:?}")]
    InvalidPort {
        /// Port as received
        port: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FloodnetError>;

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_error_converts() {
        let err: FloodnetError = RoutingError::InvalidPort {
            port: "99999".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            FloodnetError::Routing(RoutingError::InvalidPort { .. })
        ));
        assert!(err.to_string().contains("99999"));
    }

    #[test]
    fn test_network_error_display() {
        let err = NetworkError::MessageTooLarge { size: 600, max: 512 };
        assert_eq!(
            err.to_string(),
            "Message too large: 600 bytes (max: 512 bytes)"
        );
    }
}
