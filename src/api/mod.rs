//! High-level API for floodnet
//!
//! The two kinds of node a deployment runs: a [`Directory`] that tracks live
//! routers, and a [`RouterNode`] that floods broadcasts to its peers.

pub mod config;
pub mod directory;
pub mod node;

// Re-export main types for convenience
pub use config::{CacheConfig, ConfigFile, DirectoryConfig, RouterConfig};
pub use directory::{Directory, DirectoryService};
pub use node::{BroadcastReceipt, NodeBuilder, NodeState, RouterNode, RouterService};
