//! Common test helpers and utilities
//!
//! [`Mesh`] wires several flood handlers onto one in-memory network and
//! delivers the datagrams they exchange one at a time, so a whole flood can be
//! replayed deterministically.

#![allow(dead_code)]

use floodnet::network::{MemoryNetwork, MemoryTransport};
use floodnet::protocol::{FloodEnvelope, Request};
use floodnet::routing::{FloodOutcome, FloodProtocol, MessageCache, PeerTable};
use serde_json::{json, Map};
use std::net::SocketAddr;
use std::sync::Arc;

/// Port every mesh router listens on
pub const ROUTER_PORT: u16 = 5555;

/// Upper bound on delivered datagrams before a flood counts as runaway
pub const MAX_DELIVERIES: usize = 100_000;

/// One router of a [`Mesh`]
pub struct MeshNode {
    pub addr: SocketAddr,
    pub flood: FloodProtocol<MemoryTransport>,
    pub routers: Arc<PeerTable>,
    pub clients: Arc<PeerTable>,
}

/// A broadcast that reached a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub node: usize,
    pub from: SocketAddr,
    pub id: String,
    pub hops: u8,
    pub outcome: FloodOutcome,
}

/// A broadcast that reached an address that is not a router
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDelivery {
    pub client: SocketAddr,
    pub from: SocketAddr,
    pub envelope: FloodEnvelope,
}

/// Routers on a shared in-memory network
pub struct Mesh {
    pub network: MemoryNetwork,
    pub nodes: Vec<MeshNode>,
    pub arrivals: Vec<Arrival>,
    pub client_deliveries: Vec<ClientDelivery>,
}

/// Address of router `index`; every router gets its own IP
pub fn router_addr(index: usize) -> SocketAddr {
    SocketAddr::new(format!("10.0.{}.{}", index / 250, index % 250 + 1).parse().unwrap(), ROUTER_PORT)
}

/// Envelope carrying a small payload
pub fn envelope(id: &str) -> FloodEnvelope {
    let mut payload = Map::new();
    payload.insert("text".to_string(), json!("hello mesh"));
    FloodEnvelope::new(id, payload)
}

impl Mesh {
    /// `count` routers with no links between them
    pub fn new(count: usize, hop_limit: u8) -> Self {
        let network = MemoryNetwork::new();
        let nodes = (0..count)
            .map(|index| {
                let addr = router_addr(index);
                let routers = Arc::new(PeerTable::with_ttl("routers", 90, 16));
                let clients = Arc::new(PeerTable::with_ttl("clients", 10, 16));
                let flood = FloodProtocol::new(
                    ROUTER_PORT,
                    hop_limit,
                    Arc::new(MessageCache::with_ttl(30, 64)),
                    Arc::clone(&routers),
                    Arc::clone(&clients),
                    Arc::new(network.endpoint(addr)),
                );
                MeshNode {
                    addr,
                    flood,
                    routers,
                    clients,
                }
            })
            .collect();

        Self {
            network,
            nodes,
            arrivals: Vec::new(),
            client_deliveries: Vec::new(),
        }
    }

    /// Make `a` and `b` know each other as routers
    pub fn link(&self, a: usize, b: usize) {
        self.nodes[a].routers.register(self.nodes[b].addr);
        self.nodes[b].routers.register(self.nodes[a].addr);
    }

    /// Link every pair of routers
    pub fn link_all(&self) {
        for a in 0..self.nodes.len() {
            for b in a + 1..self.nodes.len() {
                self.link(a, b);
            }
        }
    }

    /// Link routers in a line, 0 - 1 - 2 - ...
    pub fn link_chain(&self) {
        for a in 1..self.nodes.len() {
            self.link(a - 1, a);
        }
    }

    /// Register a local client with router `node`
    pub fn add_client(&self, node: usize, client: SocketAddr) {
        self.nodes[node].clients.register(client);
    }

    /// Originate a broadcast at router `node`
    pub async fn originate(&self, node: usize, envelope: FloodEnvelope) -> FloodOutcome {
        self.nodes[node].flood.handle(envelope, None).await
    }

    /// Deliver datagrams until the network is quiet
    ///
    /// Panics if the flood does not die out within [`MAX_DELIVERIES`].
    pub async fn run(&mut self) {
        let mut delivered = 0;
        while let Some(datagram) = self.network.pop() {
            delivered += 1;
            assert!(delivered <= MAX_DELIVERIES, "flood did not terminate");

            let Request::Broadcast(envelope) = Request::parse(&datagram.payload).unwrap() else {
                panic!("only broadcasts travel the mesh");
            };

            match self.nodes.iter().position(|node| node.addr == datagram.to) {
                Some(index) => {
                    let id = envelope.id.clone();
                    let hops = envelope.hops;
                    let outcome = self.nodes[index]
                        .flood
                        .handle(envelope, Some(datagram.from.ip()))
                        .await;
                    self.arrivals.push(Arrival {
                        node: index,
                        from: datagram.from,
                        id,
                        hops,
                        outcome,
                    });
                },
                None => self.client_deliveries.push(ClientDelivery {
                    client: datagram.to,
                    from: datagram.from,
                    envelope,
                }),
            }
        }
    }

    /// Arrivals at `node` that were forwarded
    pub fn forwarded_at(&self, node: usize) -> Vec<&Arrival> {
        self.arrivals
            .iter()
            .filter(|a| a.node == node && matches!(a.outcome, FloodOutcome::Forwarded { .. }))
            .collect()
    }

    /// Arrivals at `node` with any outcome
    pub fn arrivals_at(&self, node: usize) -> Vec<&Arrival> {
        self.arrivals.iter().filter(|a| a.node == node).collect()
    }
}

/// Poll `condition` every 10 ms until it holds, for at most five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
