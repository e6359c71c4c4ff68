//! Flood protocol for broadcast propagation
//!
//! Every router forwards a broadcast to all routers it knows (except those on
//! the address it came from) and to all of its local clients. Two mechanisms
//! stop the flood:
//!
//! - the hop counter, which bounds how far a message travels
//! - the message cache, which stops a router from forwarding the same id twice
//!   when copies arrive over different paths
//!
//! Forwarding is fire-and-forget; nobody acknowledges anything.

use crate::network::transport::Transport;
use crate::protocol::{FloodEnvelope, MAX_MESSAGE_SIZE};
use crate::routing::dedup::MessageCache;
use crate::routing::peer_table::{send_all, PeerTable};
use std::net::IpAddr;
use std::sync::Arc;

/// What happened to one incoming envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodOutcome {
    /// Arrived with `hops >= hop_limit`
    HopLimitReached,
    /// Id was already in the message cache
    Duplicate,
    /// Rewritten envelope does not fit in one datagram
    TooLarge {
        /// Encoded size in bytes
        size: usize,
    },
    /// Rewritten and sent on
    Forwarded {
        /// Routers the envelope was delivered to
        routers: usize,
        /// Local clients the envelope was delivered to
        clients: usize,
    },
}

/// Flood state machine shared by all request handlers of one router
pub struct FloodProtocol<T> {
    listen_port: u16,
    hop_limit: u8,
    messages: Arc<MessageCache>,
    routers: Arc<PeerTable>,
    clients: Arc<PeerTable>,
    transport: Arc<T>,
}

impl<T: Transport> FloodProtocol<T> {
    /// Create a flood handler
    ///
    /// # Arguments
    ///
    /// * `listen_port` - Written into `hop-port` of every forwarded envelope
    /// * `hop_limit` - Envelopes arriving with this many hops are dropped
    /// * `messages` - Cache of recently forwarded ids
    /// * `routers` - Router set learned from the directory
    /// * `clients` - Locally registered clients
    /// * `transport` - Datagram sender
    pub fn new(
        listen_port: u16,
        hop_limit: u8,
        messages: Arc<MessageCache>,
        routers: Arc<PeerTable>,
        clients: Arc<PeerTable>,
        transport: Arc<T>,
    ) -> Self {
        Self {
            listen_port,
            hop_limit,
            messages,
            routers,
            clients,
            transport,
        }
    }

    /// Decide whether to forward and rewrite the envelope if so
    ///
    /// Returns the terminal outcome when the envelope must be dropped.
    pub fn admit(&self, envelope: &mut FloodEnvelope) -> Result<(), FloodOutcome> {
        if envelope.hops >= self.hop_limit {
            tracing::debug!(id = %envelope.id, hops = envelope.hops, "hop limit reached");
            return Err(FloodOutcome::HopLimitReached);
        }
        if self.messages.seen(&envelope.id) {
            tracing::debug!(id = %envelope.id, "duplicate dropped");
            return Err(FloodOutcome::Duplicate);
        }

        envelope.hops += 1;
        envelope.hop_port = self.listen_port;
        Ok(())
    }

    /// Run one envelope through the state machine
    ///
    /// `from` is the address the envelope arrived from; routers on that
    /// address are skipped. Pass `None` for locally originated messages.
    pub async fn handle(&self, mut envelope: FloodEnvelope, from: Option<IpAddr>) -> FloodOutcome {
        if let Err(outcome) = self.admit(&mut envelope) {
            return outcome;
        }

        let payload = envelope.encode();
        if payload.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(id = %envelope.id, size = payload.len(), "broadcast too large to forward");
            return FloodOutcome::TooLarge { size: payload.len() };
        }

        let router_targets = self.routers.addresses_excluding(from);
        let client_targets = self.clients.addresses_excluding(None);

        let routers = send_all(self.transport.as_ref(), &router_targets, &payload).await;
        let clients = send_all(self.transport.as_ref(), &client_targets, &payload).await;

        tracing::debug!(
            id = %envelope.id,
            hops = envelope.hops,
            routers,
            clients,
            "broadcast forwarded"
        );
        FloodOutcome::Forwarded { routers, clients }
    }

    /// Configured hop limit
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    /// Port written into forwarded envelopes
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Cache of recently forwarded ids
    pub fn messages(&self) -> &Arc<MessageCache> {
        &self.messages
    }
}
