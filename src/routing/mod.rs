//! Peer tracking and broadcast propagation
//!
//! # Architecture
//!
//! - **PeerTable**: expiring set of peers, used for a directory's registered
//!   routers and for a router's local clients and known routers
//! - **MessageCache**: expiring set of message ids for duplicate suppression
//! - **FloodProtocol**: the broadcast state machine built on both
//!
//! # Flooding
//!
//! ```text
//!   receive ──► hops >= limit? ──yes──► drop
//!                   │ no
//!                   ▼
//!              id seen before? ──yes──► drop
//!                   │ no
//!                   ▼
//!       hops += 1, hop-port = own port
//!                   │
//!                   ▼
//!   send to routers (minus sender's address) and all clients
//! ```

pub mod dedup;
pub mod gossip;
pub mod peer_table;

pub use dedup::MessageCache;
pub use gossip::{FloodOutcome, FloodProtocol};
pub use peer_table::{PeerRecord, PeerTable};
