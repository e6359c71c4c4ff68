//! Configuration types for directories and routers
//!
//! Every setting has a default, so a config file only needs the keys it
//! changes. Command-line flags are applied on top by the binaries.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory listen port
pub const DEFAULT_DIRECTORY_PORT: u16 = 6666;

/// Default router listen port
pub const DEFAULT_ROUTER_PORT: u16 = 5555;

/// Default ceiling on concurrently running request handlers
pub const DEFAULT_MAX_WORKERS: usize = 1000;

/// Largest hop limit the single-digit `hops` field can express
pub const MAX_HOP_LIMIT: u8 = 9;

/// Sizing and timing of one expiring table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Ticks an entry lives without a refresh
    pub ttl_ticks: u64,

    /// Seconds between ticks
    pub resolution_secs: u64,

    /// Number of hash buckets
    pub buckets: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ticks: 10,
            resolution_secs: 1,
            buckets: 64,
        }
    }
}

impl CacheConfig {
    /// Config with a different TTL and default timing
    pub fn with_ttl(ttl_ticks: u64) -> Self {
        Self {
            ttl_ticks,
            ..Default::default()
        }
    }

    /// Wall-clock time between ticks
    pub fn resolution(&self) -> Duration {
        Duration::from_secs(self.resolution_secs)
    }

    /// Wall-clock lifetime of an entry
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.resolution_secs.saturating_mul(self.ttl_ticks))
    }

    /// Reject zero values
    pub fn validate(&self, table: &str) -> Result<(), ConfigError> {
        if self.ttl_ticks == 0 {
            return Err(ConfigError::invalid(&format!("{table}.ttl_ticks"), "must be positive"));
        }
        if self.resolution_secs == 0 {
            return Err(ConfigError::invalid(
                &format!("{table}.resolution_secs"),
                "must be positive",
            ));
        }
        if self.buckets == 0 {
            return Err(ConfigError::invalid(&format!("{table}.buckets"), "must be positive"));
        }
        Ok(())
    }
}

/// Directory server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    /// TCP and UDP listen port; 0 picks a free port
    pub listen_port: u16,

    /// Maximum concurrent connection and datagram handlers
    pub max_workers: usize,

    /// Registered router table
    pub peers: CacheConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_DIRECTORY_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
            peers: CacheConfig::default(),
        }
    }
}

impl DirectoryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("max_workers", "must be positive"));
        }
        self.peers.validate("peers")
    }
}

/// Router node configuration
///
/// The keep-alive interval must stay below the directory's peer lifetime,
/// otherwise the router will flap in and out of discover results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// TCP and UDP listen port
    pub listen_port: u16,

    /// Maximum concurrent connection and datagram handlers
    pub max_workers: usize,

    /// Directory host name or address
    pub directory_address: String,

    /// Directory port
    pub directory_port: u16,

    /// Envelopes arriving with this many hops are dropped
    pub hop_limit: u8,

    /// Number of routers requested from the directory
    pub outdegree: usize,

    /// Seconds between keep-alives to the directory
    pub keepalive_interval_secs: u64,

    /// Seconds between router set refreshes
    pub router_refresh_interval_secs: u64,

    /// Seconds to wait after a failed refresh
    pub directory_retry_interval_secs: u64,

    /// Locally registered clients
    pub clients: CacheConfig,

    /// Recently seen message ids
    pub messages: CacheConfig,

    /// Routers learned from the directory
    pub routers: CacheConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_ROUTER_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
            directory_address: "127.0.0.1".to_string(),
            directory_port: DEFAULT_DIRECTORY_PORT,
            hop_limit: 4,
            outdegree: 32,
            keepalive_interval_secs: 9,
            router_refresh_interval_secs: 30,
            directory_retry_interval_secs: 30,
            clients: CacheConfig::default(),
            messages: CacheConfig::default(),
            routers: CacheConfig::with_ttl(90),
        }
    }
}

impl RouterConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when:
    /// - `listen_port` is 0 (peers need a fixed port to reach us)
    /// - `hop_limit` is outside `1..=9`
    /// - any interval, `max_workers` or `outdegree` is 0
    /// - a table config has a zero field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::invalid("listen_port", "must be a fixed port"));
        }
        if self.directory_address.trim().is_empty() {
            return Err(ConfigError::invalid("directory_address", "must not be empty"));
        }
        if self.directory_port == 0 {
            return Err(ConfigError::invalid("directory_port", "must be positive"));
        }
        if !(1..=MAX_HOP_LIMIT).contains(&self.hop_limit) {
            return Err(ConfigError::invalid(
                "hop_limit",
                &format!("must be between 1 and {MAX_HOP_LIMIT}"),
            ));
        }
        for (field, value) in [
            ("max_workers", self.max_workers as u64),
            ("outdegree", self.outdegree as u64),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("router_refresh_interval_secs", self.router_refresh_interval_secs),
            ("directory_retry_interval_secs", self.directory_retry_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        self.clients.validate("clients")?;
        self.messages.validate("messages")?;
        self.routers.validate("routers")
    }

    /// Time between keep-alives
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Time between router set refreshes
    pub fn router_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.router_refresh_interval_secs)
    }

    /// Time to wait after a failed refresh
    pub fn directory_retry_interval(&self) -> Duration {
        Duration::from_secs(self.directory_retry_interval_secs)
    }
}

/// Contents of a `floodnet.toml` file
///
/// ```toml
/// [directory]
/// listen_port = 6666
///
/// [router]
/// directory_address = "dir.example.net"
/// hop_limit = 5
///
/// [router.messages]
/// ttl_ticks = 30
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// `[directory]` section
    pub directory: Option<DirectoryConfig>,

    /// `[router]` section
    pub router: Option<RouterConfig>,
}

impl ConfigFile {
    /// Platform config file location
    ///
    /// - Linux: `~/.config/floodnet/floodnet.toml`
    /// - macOS: `~/Library/Application Support/floodnet/floodnet.toml`
    /// - Windows: `%APPDATA%/floodnet/config/floodnet.toml`
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "floodnet")
            .map(|dirs| dirs.config_dir().join("floodnet.toml"))
            .unwrap_or_else(|| PathBuf::from("floodnet.toml"))
    }

    /// Parse TOML text
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Unparseable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Read and parse a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Read a file, falling back to defaults when it does not exist
    ///
    /// A missing file is logged as a warning. A file that exists but cannot be
    /// read or parsed is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
