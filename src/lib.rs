//! # floodnet
//!
//! A flooding broadcast overlay: routers register with a directory, learn
//! about each other from it, and forward every broadcast to the routers and
//! local clients they know, bounded by a hop limit and a cache of recently
//! seen message ids.
//!
//! ## Quick Start
//!
//! ```no_run
//! use floodnet::NodeBuilder;
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut node = NodeBuilder::new()
//!         .with_directory("127.0.0.1", 6666)
//!         .build()?;
//!     node.start().await?;
//!
//!     let mut payload = Map::new();
//!     payload.insert("text".to_string(), json!("hello"));
//!     node.broadcast(payload).await?;
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! The expiring tables underneath are usable on their own:
//!
//! ```
//! use floodnet::cache::ExpiringTable;
//!
//! let table: ExpiringTable<&str, u32> = ExpiringTable::new(2, 16, ());
//! table.insert("a", 1);
//! table.tick();
//! assert!(table.contains(&"a"));
//! table.tick();
//! assert!(!table.contains(&"a"));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod cache;
pub mod error;
pub mod network;
pub mod protocol;
pub mod routing;

// Re-export main types
pub use api::{
    BroadcastReceipt, CacheConfig, ConfigFile, Directory, DirectoryConfig, NodeBuilder, NodeState,
    RouterConfig, RouterNode,
};
pub use cache::{ExpiringTable, ExpiryHooks, Tick, Ticker};
pub use error::{ConfigError, FloodnetError, NetworkError, ProtocolError, Result, RoutingError};
pub use network::{DirectoryClient, MemoryNetwork, MemoryTransport, Transport, UdpTransport};
pub use protocol::{FloodEnvelope, PeerJson, Request, Response};
pub use routing::{FloodOutcome, FloodProtocol, MessageCache, PeerRecord, PeerTable};
