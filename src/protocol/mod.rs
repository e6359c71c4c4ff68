//! Protocol module
//!
//! Wire format for directory and router traffic. Requests are JSON objects
//! selected by a `method` field; replies are a JSON status header optionally
//! followed by a sized JSON body. Every TCP message ends with `\r\n\r\n`.

pub mod messages;
pub mod response;

use thiserror::Error;

pub use messages::{FloodEnvelope, PeerJson, Request, WireMessage};
pub use response::{Response, ResponseHeader};

/// Terminator for every TCP message and reply body
pub const MESSAGE_DELIMITER: &[u8] = b"\r\n\r\n";

/// Maximum size of one request or datagram, delimiter included
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Width of the space-padded `hop-port` field
pub const HOP_PORT_WIDTH: usize = 5;

/// Numeric error codes carried in error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No `method` field, or the message did not parse at all
    NoMethod = 0,
    /// Required `num` argument missing
    NoNum = 1,
    /// Required `port` argument missing
    NoPort = 2,
    /// `method` names nothing this service handles
    BadMethod = 3,
    /// `num` is not a usable count
    BadNum = 4,
    /// `port` is outside 0..=65535
    BadPort = 5,
}

impl ErrorCode {
    /// Code as sent on the wire
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Fixed human-readable reason for the code
    pub fn reason(self) -> &'static str {
        match self {
            ErrorCode::NoMethod => "no method given",
            ErrorCode::NoNum => "missing argument 'num'",
            ErrorCode::NoPort => "missing argument 'port'",
            ErrorCode::BadMethod => "unrecognized method",
            ErrorCode::BadNum => "invalid argument 'num'",
            ErrorCode::BadPort => "invalid argument 'port'",
        }
    }

    /// Whether a TCP connection should be closed after replying
    ///
    /// Method errors mean we cannot trust the stream any more; argument errors
    /// leave the connection usable.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::NoMethod | ErrorCode::BadMethod)
    }

    /// Look up a code received from a remote peer
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::NoMethod,
            1 => ErrorCode::NoNum,
            2 => ErrorCode::NoPort,
            3 => ErrorCode::BadMethod,
            4 => ErrorCode::BadNum,
            5 => ErrorCode::BadPort,
            _ => return None,
        })
    }
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Bytes are not a JSON object
    #[error("Malformed message: {reason}")]
    Malformed {
        /// Parser message
        reason: String,
    },

    /// Message has no `method` field
    #[error("Message has no method")]
    MissingMethod,

    /// `method` names nothing this service handles
    #[error("Unknown method: {method}")]
    UnknownMethod {
        /// Method as received
        method: String,
    },

    /// A required argument is absent
    #[error("Missing field '{field}'")]
    MissingField {
        /// Field name
        field: &'static str,
    },

    /// An argument is present but unusable
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Message exceeded [`MAX_MESSAGE_SIZE`]
    #[error("Message too large: {0} bytes (max: {1} bytes)")]
    MessageTooLarge(usize, usize),
}

impl ProtocolError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Error code to report for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Malformed { .. }
            | ProtocolError::MissingMethod
            | ProtocolError::MessageTooLarge(..) => ErrorCode::NoMethod,
            ProtocolError::UnknownMethod { .. } => ErrorCode::BadMethod,
            ProtocolError::MissingField { field } if *field == "port" => ErrorCode::NoPort,
            ProtocolError::MissingField { .. } => ErrorCode::NoNum,
            ProtocolError::InvalidField { field, .. } if *field == "port" => ErrorCode::BadPort,
            ProtocolError::InvalidField { .. } => ErrorCode::BadNum,
        }
    }
}
