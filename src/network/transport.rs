//! Datagram sending
//!
//! The flood protocol and keep-alive loop only need to fire datagrams at
//! addresses. [`Transport`] is that seam: [`UdpTransport`] sends real UDP,
//! [`MemoryTransport`] queues datagrams in memory so whole meshes can be
//! simulated deterministically.

use crate::error::{NetworkError, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Fire-and-forget datagram delivery
pub trait Transport: Send + Sync {
    /// Send one datagram to `target`
    fn send_to(&self, payload: &[u8], target: SocketAddr) -> impl Future<Output = Result<()>> + Send;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_to(&self, payload: &[u8], target: SocketAddr) -> impl Future<Output = Result<()>> + Send {
        (**self).send_to(payload, target)
    }
}

/// Transport over a bound UDP socket
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Wrap an already bound socket
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Bind a fresh socket
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(Arc::new(socket)))
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(payload, target)
            .await
            .map_err(|e| NetworkError::SendFailed {
                address: target,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// A datagram queued on a [`MemoryNetwork`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sending endpoint
    pub from: SocketAddr,
    /// Destination endpoint
    pub to: SocketAddr,
    /// Bytes sent
    pub payload: Vec<u8>,
}

/// Shared FIFO that every [`MemoryTransport`] on it sends into
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    queue: Arc<Mutex<VecDeque<Datagram>>>,
}

impl MemoryNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that sends from `local`
    pub fn endpoint(&self, local: SocketAddr) -> MemoryTransport {
        MemoryTransport {
            local,
            network: self.clone(),
            unreachable: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Oldest undelivered datagram
    pub fn pop(&self) -> Option<Datagram> {
        self.queue.lock().pop_front()
    }

    /// Number of undelivered datagrams
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// In-memory transport
///
/// Sends succeed unless the target was marked with
/// [`fail_to`](Self::fail_to), in which case nothing is queued.
#[derive(Clone)]
pub struct MemoryTransport {
    local: SocketAddr,
    network: MemoryNetwork,
    unreachable: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl MemoryTransport {
    /// Standalone endpoint on its own private network
    pub fn new(local: SocketAddr) -> Self {
        MemoryNetwork::new().endpoint(local)
    }

    /// Address this endpoint sends from
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Make every later send to `target` fail
    pub fn fail_to(&self, target: SocketAddr) {
        self.unreachable.lock().insert(target);
    }

    /// Remove and return everything this endpoint has sent so far
    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut queue = self.network.queue.lock();
        let (mine, others): (VecDeque<_>, VecDeque<_>) =
            queue.drain(..).partition(|d| d.from == self.local);
        *queue = others;
        mine.into_iter().map(|d| (d.to, d.payload)).collect()
    }
}

impl Transport for MemoryTransport {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        if self.unreachable.lock().contains(&target) {
            return Err(NetworkError::SendFailed {
                address: target,
                reason: "unreachable".to_string(),
            }
            .into());
        }
        self.network.queue.lock().push_back(Datagram {
            from: self.local,
            to: target,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_delivers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        transport.send_to(b"ping", target).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, transport.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_memory_network_is_fifo() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("10.0.0.1:1".parse().unwrap());
        let b = network.endpoint("10.0.0.2:1".parse().unwrap());

        a.send_to(b"first", b.local_addr()).await.unwrap();
        b.send_to(b"second", a.local_addr()).await.unwrap();
        assert_eq!(network.pending(), 2);

        let first = network.pop().unwrap();
        assert_eq!(first.from, a.local_addr());
        assert_eq!(first.payload, b"first");
        assert_eq!(network.pop().unwrap().payload, b"second");
        assert!(network.pop().is_none());
    }

    #[tokio::test]
    async fn test_take_sent_only_drains_own_datagrams() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("10.0.0.1:1".parse().unwrap());
        let b = network.endpoint("10.0.0.2:1".parse().unwrap());

        a.send_to(b"from a", b.local_addr()).await.unwrap();
        b.send_to(b"from b", a.local_addr()).await.unwrap();

        let sent = a.take_sent();
        assert_eq!(sent, vec![(b.local_addr(), b"from a".to_vec())]);
        assert_eq!(network.pending(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let transport = MemoryTransport::new("10.0.0.1:1".parse().unwrap());
        let dead: SocketAddr = "10.0.0.2:1".parse().unwrap();
        transport.fail_to(dead);

        assert!(transport.send_to(b"x", dead).await.is_err());
        assert!(transport.take_sent().is_empty());
    }
}
