//! Request parsing and construction
//!
//! Incoming bytes are first parsed into a [`WireMessage`] (a JSON object),
//! then the `method` field decides which arguments are extracted into a typed
//! [`Request`]. Arguments may arrive as JSON numbers or as strings.

use crate::protocol::{ProtocolError, HOP_PORT_WIDTH, MAX_MESSAGE_SIZE, MESSAGE_DELIMITER};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Method names understood by directories and routers
pub mod method {
    /// Directory: list registered peers
    pub const LIST: &str = "list";
    /// Directory/router: list peers excluding the caller
    pub const DISCOVER: &str = "discover";
    /// Service name and load
    pub const INFO: &str = "info";
    /// Router: echo the caller's address
    pub const IP: &str = "ip";
    /// Router: liveness probe
    pub const PING: &str = "ping";
    /// Router: reply to a UDP ping
    pub const PONG: &str = "pong";
    /// Register or refresh a peer
    pub const CONNECT: &str = "connect";
    /// Drop a peer registration
    pub const DISCONNECT: &str = "disconnect";
    /// Flooded message
    pub const BROADCAST: &str = "broadcast";
}

const FIELD_METHOD: &str = "method";
const FIELD_HOPS: &str = "hops";
const FIELD_HOP_PORT: &str = "hop-port";
const FIELD_ID: &str = "id";

/// A parsed but not yet interpreted message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    fields: Map<String, Value>,
}

impl WireMessage {
    /// Parse raw bytes; trailing whitespace such as the delimiter is allowed
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(bytes.len(), MAX_MESSAGE_SIZE));
        }

        let value: Value = serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })?;

        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ProtocolError::Malformed {
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    /// Value of the `method` field
    pub fn method(&self) -> Result<&str, ProtocolError> {
        match self.fields.get(FIELD_METHOD) {
            Some(Value::String(method)) => Ok(method),
            _ => Err(ProtocolError::MissingMethod),
        }
    }

    /// Textual form of a scalar field, or `None` if absent
    pub fn scalar(&self, field: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.fields.get(field) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(number)) => Ok(Some(number.to_string())),
            Some(other) => Err(ProtocolError::invalid(
                field,
                format!("expected a string or number, got {}", json_kind(other)),
            )),
        }
    }

    /// Textual form of a required scalar field
    pub fn require(&self, field: &'static str) -> Result<String, ProtocolError> {
        self.scalar(field)?
            .ok_or(ProtocolError::MissingField { field })
    }

    /// A required non-negative count
    pub fn count(&self, field: &'static str) -> Result<usize, ProtocolError> {
        let text = self.require(field)?;
        text.trim()
            .parse()
            .map_err(|_| ProtocolError::invalid(field, format!("{text:?} is not a count")))
    }

    /// An optional port number
    pub fn port(&self, field: &'static str) -> Result<Option<u16>, ProtocolError> {
        self.scalar(field)?
            .map(|text| {
                parse_port(&text)
                    .ok_or_else(|| ProtocolError::invalid(field, format!("{text:?} is not a port")))
            })
            .transpose()
    }

    /// Consume the message, yielding its raw fields
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Parse a decimal port, tolerating surrounding spaces
pub fn parse_port(text: &str) -> Option<u16> {
    text.trim().parse().ok()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A request to a directory or router
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Up to `num` registered peers
    List {
        /// Maximum number of peers to return
        num: usize,
    },
    /// Up to `num` peers, excluding the caller listening on `port`
    Discover {
        /// Maximum number of peers to return
        num: usize,
        /// Caller's listen port, when given
        port: Option<u16>,
    },
    /// Service name and load figures
    Info,
    /// Caller's address as seen by the server
    Ip,
    /// Liveness probe; over UDP `port` says where to send the pong
    Ping {
        /// Port to answer on
        port: Option<u16>,
    },
    /// Answer to a UDP ping
    Pong,
    /// Register or refresh the caller at `port`
    Connect {
        /// Port as received; validated by the peer table
        port: String,
    },
    /// Remove the caller's registration at `port`
    Disconnect {
        /// Port as received; validated by the peer table
        port: String,
    },
    /// A flooded message
    Broadcast(FloodEnvelope),
}

impl Request {
    /// Parse raw bytes into a request
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_message(WireMessage::parse(bytes)?)
    }

    /// Interpret an already parsed message
    pub fn from_message(message: WireMessage) -> Result<Self, ProtocolError> {
        let name = message.method()?.to_string();
        let request = match name.as_str() {
            method::LIST => Request::List {
                num: message.count("num")?,
            },
            method::DISCOVER => Request::Discover {
                num: message.count("num")?,
                port: message.port("port")?,
            },
            method::INFO => Request::Info,
            method::IP => Request::Ip,
            method::PING => Request::Ping {
                port: message.port("port")?,
            },
            method::PONG => Request::Pong,
            method::CONNECT => Request::Connect {
                port: message.require("port")?,
            },
            method::DISCONNECT => Request::Disconnect {
                port: message.require("port")?,
            },
            method::BROADCAST => Request::Broadcast(FloodEnvelope::from_message(message)?),
            _ => return Err(ProtocolError::UnknownMethod { method: name }),
        };
        Ok(request)
    }

    /// Method name of this request
    pub fn method(&self) -> &'static str {
        match self {
            Request::List { .. } => method::LIST,
            Request::Discover { .. } => method::DISCOVER,
            Request::Info => method::INFO,
            Request::Ip => method::IP,
            Request::Ping { .. } => method::PING,
            Request::Pong => method::PONG,
            Request::Connect { .. } => method::CONNECT,
            Request::Disconnect { .. } => method::DISCONNECT,
            Request::Broadcast(_) => method::BROADCAST,
        }
    }

    /// Serialize as a delimited message
    pub fn encode(&self) -> Vec<u8> {
        if let Request::Broadcast(envelope) = self {
            return envelope.encode();
        }

        let mut fields = Map::new();
        fields.insert(FIELD_METHOD.to_string(), Value::from(self.method()));
        match self {
            Request::List { num } => {
                fields.insert("num".to_string(), Value::from(*num));
            },
            Request::Discover { num, port } => {
                fields.insert("num".to_string(), Value::from(*num));
                if let Some(port) = port {
                    fields.insert("port".to_string(), Value::from(*port));
                }
            },
            Request::Ping { port: Some(port) } => {
                fields.insert("port".to_string(), Value::from(*port));
            },
            Request::Connect { port } | Request::Disconnect { port } => {
                let value = match parse_port(port) {
                    Some(number) => Value::from(number),
                    None => Value::from(port.as_str()),
                };
                fields.insert("port".to_string(), value);
            },
            _ => {},
        }
        encode_object(fields)
    }
}

fn encode_object(fields: Map<String, Value>) -> Vec<u8> {
    let mut bytes = Value::Object(fields).to_string().into_bytes();
    bytes.extend_from_slice(MESSAGE_DELIMITER);
    bytes
}

/// A broadcast message in transit
///
/// Fields other than `method`, `hops`, `hop-port` and `id` are carried along
/// untouched in `payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct FloodEnvelope {
    /// Routers this message has passed through
    pub hops: u8,
    /// Listen port of the node that last forwarded the message, 0 before the first hop
    pub hop_port: u16,
    /// Message identifier used for duplicate suppression
    pub id: String,
    /// Application fields
    pub payload: Map<String, Value>,
}

impl FloodEnvelope {
    /// Fresh envelope with zero hops
    pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            hops: 0,
            hop_port: 0,
            id: id.into(),
            payload,
        }
    }

    /// Fresh envelope with a generated id
    pub fn originate(payload: Map<String, Value>) -> Self {
        let id = generate_message_id(Value::Object(payload.clone()).to_string().as_bytes());
        Self::new(id, payload)
    }

    /// Extract the envelope from a `broadcast` message
    pub fn from_message(message: WireMessage) -> Result<Self, ProtocolError> {
        let hops = parse_hops(&message.require(FIELD_HOPS)?)?;
        let id = message.require(FIELD_ID)?;
        if id.is_empty() {
            return Err(ProtocolError::invalid(FIELD_ID, "empty message id"));
        }
        let hop_port = message.require(FIELD_HOP_PORT)?;
        let hop_port = parse_port(&hop_port)
            .ok_or_else(|| ProtocolError::invalid(FIELD_HOP_PORT, format!("{hop_port:?} is not a port")))?;

        let mut payload = message.into_fields();
        for reserved in [FIELD_METHOD, FIELD_HOPS, FIELD_HOP_PORT, FIELD_ID] {
            payload.remove(reserved);
        }

        Ok(Self {
            hops,
            hop_port,
            id,
            payload,
        })
    }

    /// `hop-port` as the fixed-width, space-padded wire string
    pub fn hop_port_field(&self) -> String {
        format!("{:>width$}", self.hop_port, width = HOP_PORT_WIDTH)
    }

    /// Serialize as a delimited `broadcast` message
    pub fn encode(&self) -> Vec<u8> {
        let mut fields = Map::new();
        fields.insert(FIELD_METHOD.to_string(), Value::from(method::BROADCAST));
        fields.insert(FIELD_HOPS.to_string(), Value::from(self.hops));
        fields.insert(FIELD_HOP_PORT.to_string(), Value::from(self.hop_port_field()));
        fields.insert(FIELD_ID.to_string(), Value::from(self.id.as_str()));
        for (key, value) in &self.payload {
            fields.insert(key.clone(), value.clone());
        }
        encode_object(fields)
    }
}

fn parse_hops(text: &str) -> Result<u8, ProtocolError> {
    match text.as_bytes() {
        [digit @ b'0'..=b'9'] => Ok(digit - b'0'),
        _ => Err(ProtocolError::invalid(
            FIELD_HOPS,
            format!("{text:?} is not a single digit"),
        )),
    }
}

/// Generate a message id from content and the current time
///
/// The id is the hex BLAKE3 digest of the content followed by the time in
/// nanoseconds, so identical payloads sent at different times stay distinct.
pub fn generate_message_id(content: &[u8]) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = blake3::Hasher::new();
    hasher.update(content);
    hasher.update(&nanos.to_le_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Peer address as it appears in list and discover bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerJson {
    /// Dotted or colon-separated address
    pub ip: String,
    /// Listen port
    pub port: u16,
    /// Address family, 4 or 6
    pub ipv: u8,
}

impl PeerJson {
    /// Validate the record and turn it into a socket address
    pub fn to_socket_addr(&self) -> Result<SocketAddr, ProtocolError> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ProtocolError::invalid("ip", format!("{:?} is not an address", self.ip)))?;

        let family = match ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        };
        if family != self.ipv {
            return Err(ProtocolError::invalid(
                "ipv",
                format!("{} is an IPv{family} address but ipv is {}", self.ip, self.ipv),
            ));
        }

        Ok(SocketAddr::new(ip, self.port))
    }

    /// Parse a JSON array body into socket addresses
    pub fn parse_list(body: &[u8]) -> Result<Vec<SocketAddr>, ProtocolError> {
        let records: Vec<PeerJson> =
            serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed {
                reason: e.to_string(),
            })?;
        records.iter().map(PeerJson::to_socket_addr).collect()
    }
}

impl From<SocketAddr> for PeerJson {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
            ipv: if addr.is_ipv4() { 4 } else { 6 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_parse_list_request() {
        let request = Request::parse(b"{\"method\":\"list\",\"num\":5}\r\n\r\n").unwrap();
        assert_eq!(request, Request::List { num: 5 });
    }

    #[test]
    fn test_numbers_may_be_strings() {
        let request = Request::parse(br#"{"method":"discover","num":"3","port":"4000"}"#).unwrap();
        assert_eq!(
            request,
            Request::Discover {
                num: 3,
                port: Some(4000)
            }
        );
    }

    #[test]
    fn test_missing_method() {
        let err = Request::parse(br#"{"num":5}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingMethod);
        assert_eq!(err.code(), ErrorCode::NoMethod);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = Request::parse(b"CONNECT 4000\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert_eq!(err.code(), ErrorCode::NoMethod);

        let err = Request::parse(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_unknown_method() {
        let err = Request::parse(br#"{"method":"search"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadMethod);
    }

    #[test]
    fn test_argument_errors() {
        let err = Request::parse(br#"{"method":"list"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoNum);

        let err = Request::parse(br#"{"method":"list","num":-1}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadNum);

        let err = Request::parse(br#"{"method":"discover","num":2,"port":70000}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadPort);

        let err = Request::parse(br#"{"method":"connect"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoPort);
    }

    #[test]
    fn test_connect_keeps_raw_port() {
        let request = Request::parse(br#"{"method":"connect","port":"99999"}"#).unwrap();
        assert_eq!(
            request,
            Request::Connect {
                port: "99999".to_string()
            }
        );
    }

    #[test]
    fn test_oversized_message() {
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            WireMessage::parse(&big).unwrap_err(),
            ProtocolError::MessageTooLarge(MAX_MESSAGE_SIZE + 1, MAX_MESSAGE_SIZE)
        );
    }

    #[test]
    fn test_request_encoding() {
        let bytes = Request::Connect {
            port: "4000".to_string(),
        }
        .encode();
        assert!(bytes.ends_with(MESSAGE_DELIMITER));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"method": "connect", "port": 4000}));

        let bytes = Request::Discover {
            num: 32,
            port: Some(5555),
        }
        .encode();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"method": "discover", "num": 32, "port": 5555}));
    }

    #[test]
    fn test_broadcast_envelope_fields() {
        let raw = br#"{"method":"broadcast","hops":2,"hop-port":" 5555","id":"m1","query":"cats"}"#;
        let Request::Broadcast(envelope) = Request::parse(raw).unwrap() else {
            panic!("expected a broadcast");
        };
        assert_eq!(envelope.hops, 2);
        assert_eq!(envelope.hop_port, 5555);
        assert_eq!(envelope.id, "m1");
        assert_eq!(envelope.payload.len(), 1);
        assert_eq!(envelope.payload["query"], json!("cats"));
    }

    #[test]
    fn test_broadcast_requires_hop_port() {
        let err = Request::parse(br#"{"method":"broadcast","hops":0,"id":"m1"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField { field: "hop-port" });

        let err = Request::parse(br#"{"method":"broadcast","hops":0,"hop-port":"abc","id":"m1"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "hop-port", .. }));
    }

    #[test]
    fn test_hop_port_is_fixed_width() {
        let mut envelope = FloodEnvelope::new("m1", Map::new());
        envelope.hop_port = 80;
        assert_eq!(envelope.hop_port_field(), "   80");
        envelope.hop_port = 65535;
        assert_eq!(envelope.hop_port_field(), "65535");

        let value: Value = serde_json::from_slice(&envelope.encode()).unwrap();
        assert_eq!(value["hop-port"], json!("65535"));
        assert_eq!(value["hops"], json!(0));
    }

    #[test]
    fn test_hops_must_be_a_digit() {
        let err = Request::parse(br#"{"method":"broadcast","hops":12,"id":"m1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "hops", .. }));

        let err = Request::parse(br#"{"method":"broadcast","hops":"x","id":"m1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "hops", .. }));

        let err = Request::parse(br#"{"method":"broadcast","hops":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField { field: "id" });
    }

    #[test]
    fn test_envelope_survives_reencoding() {
        let mut payload = Map::new();
        payload.insert("query".to_string(), json!({"name": "song", "limit": 3}));
        let mut envelope = FloodEnvelope::new("abc", payload);
        envelope.hops = 3;
        envelope.hop_port = 4000;

        let Request::Broadcast(parsed) = Request::parse(&envelope.encode()).unwrap() else {
            panic!("expected a broadcast");
        };
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = generate_message_id(b"hello");
        let b = generate_message_id(b"hello");
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_json_from_addr() {
        let addr: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let record = PeerJson::from(addr);
        assert_eq!(serde_json::to_value(&record).unwrap(), json!({"ip": "10.0.0.5", "port": 4000, "ipv": 4}));

        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(PeerJson::from(addr).ipv, 6);
    }

    #[test]
    fn test_peer_list_parsing() {
        let body = br#"[{"ip":"10.0.0.5","port":4000,"ipv":4},{"ip":"::1","port":1,"ipv":6}]"#;
        let peers = PeerJson::parse_list(body).unwrap();
        assert_eq!(peers, vec!["10.0.0.5:4000".parse().unwrap(), "[::1]:1".parse().unwrap()]);
    }

    #[test]
    fn test_peer_list_rejects_family_mismatch() {
        let body = br#"[{"ip":"10.0.0.5","port":4000,"ipv":6}]"#;
        assert!(matches!(
            PeerJson::parse_list(body),
            Err(ProtocolError::InvalidField { field: "ipv", .. })
        ));

        let body = br#"[{"ip":"10.0.0.5","port":70000,"ipv":4}]"#;
        assert!(PeerJson::parse_list(body).is_err());
    }
}
