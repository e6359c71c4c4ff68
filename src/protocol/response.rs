//! Reply encoding and header parsing
//!
//! A reply is a JSON header terminated by `\r\n\r\n`. An okay header may carry
//! a `size`, in which case exactly that many body bytes follow; the body itself
//! ends with `\r\n\r\n` and `size` counts those four bytes.

use crate::protocol::{ErrorCode, ProtocolError, MESSAGE_DELIMITER};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reply to a TCP request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Bare success
    Okay,
    /// Success carrying a JSON body (without its delimiter)
    Body(Vec<u8>),
    /// Failure with a wire error code
    Error(ErrorCode),
}

impl Response {
    /// Build a body reply from any serializable value
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::to_vec(value)
            .map(Response::Body)
            .map_err(|e| ProtocolError::Malformed {
                reason: e.to_string(),
            })
    }

    /// Encode header and body as sent on the wire
    pub fn encode(&self) -> Vec<u8> {
        let (header, body) = match self {
            Response::Okay => (Header::okay(None), None),
            Response::Body(body) => {
                let mut framed = Vec::with_capacity(body.len() + MESSAGE_DELIMITER.len());
                framed.extend_from_slice(body);
                framed.extend_from_slice(MESSAGE_DELIMITER);
                (Header::okay(Some(framed.len())), Some(framed))
            },
            Response::Error(code) => (Header::error(*code), None),
        };

        // Header has only plain fields, so serialization cannot fail
        let mut bytes = serde_json::to_vec(&header).unwrap_or_default();
        bytes.extend_from_slice(MESSAGE_DELIMITER);
        if let Some(body) = body {
            bytes.extend_from_slice(&body);
        }
        bytes
    }

    /// Whether the connection should be closed after this reply
    pub fn closes_connection(&self) -> bool {
        matches!(self, Response::Error(code) if code.is_fatal())
    }
}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Response::Error(err.code())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Header {
    fn okay(size: Option<usize>) -> Self {
        Self {
            status: "okay".to_string(),
            size,
            code: None,
            reason: None,
        }
    }

    fn error(code: ErrorCode) -> Self {
        Self {
            status: "error".to_string(),
            size: None,
            code: Some(code.code()),
            reason: Some(code.reason().to_string()),
        }
    }
}

/// Decoded reply header, as seen by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHeader {
    /// Success; `size` body bytes follow when present
    Okay {
        /// Body length including its delimiter
        size: Option<usize>,
    },
    /// Failure reported by the server
    Error {
        /// Wire error code
        code: i64,
        /// Reason text
        reason: String,
    },
}

impl ResponseHeader {
    /// Parse a header (delimiter optional)
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header: Header = serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })?;

        match header.status.as_str() {
            "okay" => Ok(ResponseHeader::Okay { size: header.size }),
            "error" => Ok(ResponseHeader::Error {
                code: header.code.unwrap_or(-1),
                reason: header.reason.unwrap_or_default(),
            }),
            other => Err(ProtocolError::invalid("status", format!("unknown status {other:?}"))),
        }
    }
}

/// Strip the trailing delimiter from a received body
pub fn trim_body(body: &[u8]) -> &[u8] {
    body.strip_suffix(MESSAGE_DELIMITER).unwrap_or(body)
}

/// Parse a JSON body after trimming its delimiter
pub fn parse_body(body: &[u8]) -> Result<Value, ProtocolError> {
    serde_json::from_slice(trim_body(body)).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_okay_encoding() {
        assert_eq!(Response::Okay.encode(), b"{\"status\":\"okay\"}\r\n\r\n".to_vec());
    }

    #[test]
    fn test_body_size_counts_delimiter() {
        let response = Response::json(&json!([])).unwrap();
        let bytes = response.encode();
        assert_eq!(bytes, b"{\"status\":\"okay\",\"size\":6}\r\n\r\n[]\r\n\r\n".to_vec());
    }

    #[test]
    fn test_error_encoding() {
        let bytes = Response::Error(ErrorCode::BadNum).encode();
        assert_eq!(
            bytes,
            b"{\"status\":\"error\",\"code\":4,\"reason\":\"invalid argument 'num'\"}\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_closes_connection_only_on_method_errors() {
        assert!(Response::Error(ErrorCode::NoMethod).closes_connection());
        assert!(Response::from(ProtocolError::MissingMethod).closes_connection());
        assert!(!Response::Error(ErrorCode::NoPort).closes_connection());
        assert!(!Response::Okay.closes_connection());
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(
            ResponseHeader::parse(b"{\"status\":\"okay\",\"size\":12}\r\n\r\n").unwrap(),
            ResponseHeader::Okay { size: Some(12) }
        );
        assert_eq!(
            ResponseHeader::parse(b"{\"status\":\"okay\"}").unwrap(),
            ResponseHeader::Okay { size: None }
        );
        assert_eq!(
            ResponseHeader::parse(br#"{"status":"error","code":5,"reason":"invalid argument 'port'"}"#)
                .unwrap(),
            ResponseHeader::Error {
                code: 5,
                reason: "invalid argument 'port'".to_string()
            }
        );
        assert!(ResponseHeader::parse(br#"{"status":"maybe"}"#).is_err());
    }

    #[test]
    fn test_parse_body_trims_delimiter() {
        let value = parse_body(b"{\"ip\":\"127.0.0.1\"}\r\n\r\n").unwrap();
        assert_eq!(value, json!({"ip": "127.0.0.1"}));
    }
}
