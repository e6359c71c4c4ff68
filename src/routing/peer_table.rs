//! Peer liveness tracking
//!
//! A [`PeerTable`] remembers every peer that signalled recently. Peers refresh
//! themselves with `connect` keep-alives; a peer that stops signalling drops
//! out once its TTL runs down.

use crate::api::config::CacheConfig;
use crate::cache::{ExpiringTable, ExpiryHooks, Tick};
use crate::error::RoutingError;
use crate::network::transport::Transport;
use crate::protocol::messages::parse_port;
use crate::protocol::PeerJson;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;

/// A live peer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    /// Peer address
    pub ip: IpAddr,
    /// Port the peer listens on
    pub port: u16,
}

impl PeerRecord {
    /// Address the peer can be reached at
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Wire representation used in list replies
    pub fn to_json(&self) -> PeerJson {
        PeerJson::from(self.socket_addr())
    }
}

impl From<SocketAddr> for PeerRecord {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// Logs expirations under the table's name
pub struct PeerHooks {
    name: &'static str,
}

impl ExpiryHooks<SocketAddr, PeerRecord> for PeerHooks {
    fn on_expire(&self, addr: &SocketAddr, _record: &PeerRecord) {
        tracing::info!(table = self.name, peer = %addr, "peer expired");
    }
}

/// Expiring set of peers keyed by address and port
pub struct PeerTable {
    table: ExpiringTable<SocketAddr, PeerRecord, PeerHooks>,
}

impl PeerTable {
    /// Create an empty table
    ///
    /// `name` only appears in log output.
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self::with_ttl(name, config.ttl_ticks, config.buckets)
    }

    /// Create an empty table with explicit sizing
    pub fn with_ttl(name: &'static str, ttl_ticks: u64, buckets: usize) -> Self {
        Self {
            table: ExpiringTable::new(ttl_ticks, buckets, PeerHooks { name }),
        }
    }

    /// Name used in log output
    pub fn name(&self) -> &'static str {
        self.table.hooks().name
    }

    /// Register or refresh `ip` at the port given as text
    ///
    /// Returns `Ok(true)` when an existing registration was refreshed.
    ///
    /// # Errors
    ///
    /// `RoutingError::InvalidPort` if `port` is not an integer in 0..=65535.
    pub fn register_peer(&self, ip: IpAddr, port: &str) -> Result<bool, RoutingError> {
        let port = parse_port(port).ok_or_else(|| RoutingError::InvalidPort {
            port: port.to_string(),
        })?;
        Ok(self.register(SocketAddr::new(ip, port)))
    }

    /// Register or refresh a peer address
    pub fn register(&self, addr: SocketAddr) -> bool {
        let refreshed = self.table.insert(addr, PeerRecord::from(addr));
        if refreshed {
            tracing::trace!(table = self.name(), peer = %addr, "peer refreshed");
        } else {
            tracing::info!(table = self.name(), peer = %addr, "peer registered");
        }
        refreshed
    }

    /// Remove the registration of `ip` at the port given as text
    ///
    /// # Errors
    ///
    /// `RoutingError::InvalidPort` for a malformed port and
    /// `RoutingError::PeerNotFound` if nothing was registered there.
    pub fn unregister_peer(&self, ip: IpAddr, port: &str) -> Result<PeerRecord, RoutingError> {
        let port = parse_port(port).ok_or_else(|| RoutingError::InvalidPort {
            port: port.to_string(),
        })?;
        self.unregister(SocketAddr::new(ip, port))
    }

    /// Remove a peer address
    pub fn unregister(&self, addr: SocketAddr) -> Result<PeerRecord, RoutingError> {
        let record = self
            .table
            .remove(&addr)
            .ok_or(RoutingError::PeerNotFound { address: addr })?;
        tracing::info!(table = self.name(), peer = %addr, "peer removed");
        Ok(record)
    }

    /// Up to `limit` peers, oldest registration first, skipping `exclude`
    pub fn list_peers(&self, limit: usize, exclude: Option<SocketAddr>) -> Vec<PeerRecord> {
        let mut peers = Vec::with_capacity(limit.min(self.table.len()));
        if limit == 0 {
            return peers;
        }
        self.table.for_each(|addr, record| {
            if Some(*addr) != exclude {
                peers.push(*record);
            }
            if peers.len() >= limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        peers
    }

    /// Like [`list_peers`](Self::list_peers) in wire form
    pub fn list_json(&self, limit: usize, exclude: Option<SocketAddr>) -> Vec<PeerJson> {
        self.list_peers(limit, exclude)
            .iter()
            .map(PeerRecord::to_json)
            .collect()
    }

    /// Addresses of every peer not on `exclude_ip`
    pub fn addresses_excluding(&self, exclude_ip: Option<IpAddr>) -> Vec<SocketAddr> {
        let mut addrs = Vec::with_capacity(self.table.len());
        self.table.for_each(|addr, _| {
            if Some(addr.ip()) != exclude_ip {
                addrs.push(*addr);
            }
            ControlFlow::Continue(())
        });
        addrs
    }

    /// Send `payload` to every registered peer
    ///
    /// The peer list is snapshotted first so no lock is held while sending.
    /// Failed sends are logged and the peer stays registered; its TTL decides
    /// whether it is really gone. Returns the number of successful sends.
    pub async fn fan_out<T>(&self, transport: &T, payload: &[u8]) -> usize
    where
        T: Transport + ?Sized,
    {
        send_all(transport, &self.addresses_excluding(None), payload).await
    }

    /// Swap the whole table for `peers`, all with a fresh TTL
    pub fn replace<I>(&self, peers: I)
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.table
            .replace(peers.into_iter().map(|addr| (addr, PeerRecord::from(addr))));
    }

    /// Whether `addr` is registered
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.table.contains(addr)
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.table.clear();
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no peer is registered
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// TTL of a registration in ticks
    pub fn ttl_ticks(&self) -> u64 {
        self.table.ttl_ticks()
    }
}

impl Tick for PeerTable {
    fn tick(&self) -> usize {
        self.table.tick()
    }

    fn label(&self) -> &'static str {
        self.name()
    }
}

/// Send one payload to each target, logging failures
pub(crate) async fn send_all<T>(transport: &T, targets: &[SocketAddr], payload: &[u8]) -> usize
where
    T: Transport + ?Sized,
{
    let mut delivered = 0;
    for &target in targets {
        match transport.send_to(payload, target).await {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(peer = %target, error = %e, "send failed"),
        }
    }
    delivered
}
