//! Router node - the main entry point for floodnet
//!
//! A router keeps three expiring tables:
//! - local clients, registered with UDP `connect`
//! - recently flooded message ids
//! - other routers, refreshed wholesale from the directory
//!
//! Broadcasts arriving over TCP or UDP, or originated locally, are flooded to
//! the routers and clients through [`FloodProtocol`].

use crate::api::config::RouterConfig;
use crate::cache::Ticker;
use crate::error::{FloodnetError, Result};
use crate::network::discovery::{keepalive_loop, router_refresh_loop, RefreshSchedule};
use crate::network::{DirectoryClient, Listeners, Server, ServerLimits, Service, Transport, UdpTransport};
use crate::protocol::{ErrorCode, FloodEnvelope, ProtocolError, Request, Response, MAX_MESSAGE_SIZE};
use crate::routing::{FloodOutcome, FloodProtocol, MessageCache, PeerTable};
use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Name reported by `info`
pub const ROUTER_NAME: &str = "floodnet router";

/// Request handling for a router
pub struct RouterService<T> {
    flood: Arc<FloodProtocol<T>>,
    clients: Arc<PeerTable>,
    routers: Arc<PeerTable>,
    transport: Arc<T>,
}

impl<T: Transport> RouterService<T> {
    /// Serve requests with the given flood state and tables
    pub fn new(
        flood: Arc<FloodProtocol<T>>,
        clients: Arc<PeerTable>,
        routers: Arc<PeerTable>,
        transport: Arc<T>,
    ) -> Self {
        Self {
            flood,
            clients,
            routers,
            transport,
        }
    }

    fn info(&self) -> Value {
        json!({
            "name": ROUTER_NAME,
            "clients": self.clients.len(),
            "cache-load": self.flood.messages().len(),
        })
    }

    async fn pong(&self, peer: SocketAddr, port: u16) {
        let target = SocketAddr::new(peer.ip(), port);
        if let Err(e) = self.transport.send_to(&Request::Pong.encode(), target).await {
            tracing::warn!(peer = %target, error = %e, "pong failed");
        }
    }
}

impl<T: Transport + 'static> Service for RouterService<T> {
    async fn handle_request(&self, request: Request, peer: SocketAddr) -> Option<Response> {
        let response = match request {
            Request::Broadcast(envelope) => {
                self.flood.handle(envelope, Some(peer.ip())).await;
                return None;
            },
            Request::Ip => Response::json(&json!({"ip": peer.ip().to_string()})),
            Request::Info => Response::json(&self.info()),
            Request::Ping { .. } => Ok(Response::Okay),
            Request::Discover { num: 0, .. } => Ok(Response::Error(ErrorCode::BadNum)),
            Request::Discover { num, .. } => Response::json(&self.routers.list_json(num, None)),
            other => {
                tracing::debug!(peer = %peer, method = other.method(), "method not served over tcp");
                Ok(Response::Error(ErrorCode::BadMethod))
            },
        };
        Some(response.unwrap_or_else(Response::from))
    }

    async fn handle_datagram(&self, request: Request, peer: SocketAddr) {
        match request {
            Request::Connect { port } => {
                if let Err(e) = self.clients.register_peer(peer.ip(), &port) {
                    tracing::debug!(peer = %peer, error = %e, "connect rejected");
                }
            },
            Request::Disconnect { port } => {
                if let Err(e) = self.clients.unregister_peer(peer.ip(), &port) {
                    tracing::debug!(peer = %peer, error = %e, "disconnect rejected");
                }
            },
            Request::Broadcast(envelope) => {
                self.flood.handle(envelope, Some(peer.ip())).await;
            },
            Request::Ping { port: Some(port) } => self.pong(peer, port).await,
            other => {
                tracing::debug!(peer = %peer, method = other.method(), "datagram ignored");
            },
        }
    }
}

/// Current lifecycle state of a router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Built but not started
    Created,
    /// Serving and talking to the directory
    Running,
    /// Shut down
    Stopped,
}

impl NodeState {
    fn as_str(self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
        }
    }
}

/// Result of originating a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReceipt {
    /// Generated message id
    pub id: String,
    /// What the flood step did with it
    pub outcome: FloodOutcome,
}

/// Builder for [`RouterNode`]
///
/// # Examples
///
/// ```no_run
/// use floodnet::NodeBuilder;
///
/// # async fn example() -> floodnet::Result<()> {
/// let mut node = NodeBuilder::new()
///     .with_listen_port(5555)
///     .with_directory("dir.example.net", 6666)
///     .with_hop_limit(5)
///     .build()?;
///
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeBuilder {
    config: RouterConfig,
    listen_ip: IpAddr,
    listeners: Option<Listeners>,
}

impl NodeBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listeners: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Interface to bind on; all IPv4 interfaces by default
    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    /// TCP and UDP listen port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.config.listen_port = port;
        self
    }

    /// Serve on sockets bound by the caller
    ///
    /// The listen port is taken from the sockets.
    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = Some(listeners);
        self
    }

    /// Directory to register with and discover routers from
    pub fn with_directory(mut self, address: impl Into<String>, port: u16) -> Self {
        self.config.directory_address = address.into();
        self.config.directory_port = port;
        self
    }

    /// Envelopes arriving with this many hops are dropped
    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.config.hop_limit = hop_limit;
        self
    }

    /// Ceiling on concurrent request handlers
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    /// Validate the configuration and create the node's tables
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(mut self) -> Result<RouterNode> {
        if let Some(listeners) = &self.listeners {
            self.config.listen_port = listeners.local_addr()?.port();
        }
        self.config.validate()?;

        Ok(RouterNode {
            clients: Arc::new(PeerTable::new("clients", &self.config.clients)),
            routers: Arc::new(PeerTable::new("routers", &self.config.routers)),
            messages: Arc::new(MessageCache::new(&self.config.messages)),
            config: self.config,
            listen_ip: self.listen_ip,
            listeners: self.listeners,
            state: NodeState::Created,
            running: None,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Running {
    flood: Arc<FloodProtocol<UdpTransport>>,
    server: Server,
    _tickers: Vec<Ticker>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// A router in the flood overlay
pub struct RouterNode {
    config: RouterConfig,
    listen_ip: IpAddr,
    listeners: Option<Listeners>,
    clients: Arc<PeerTable>,
    routers: Arc<PeerTable>,
    messages: Arc<MessageCache>,
    state: NodeState,
    running: Option<Running>,
}

impl RouterNode {
    /// Bind, start the tick drivers and begin talking to the directory
    ///
    /// # Errors
    ///
    /// Returns an error if the node was already started or the sockets cannot
    /// be bound.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != NodeState::Created {
            return Err(self.invalid_state("start"));
        }

        let listeners = match self.listeners.take() {
            Some(listeners) => listeners,
            None => Listeners::bind(self.listen_ip, self.config.listen_port).await?,
        };
        let transport = Arc::new(UdpTransport::new(listeners.udp_socket()));
        let flood = Arc::new(FloodProtocol::new(
            self.config.listen_port,
            self.config.hop_limit,
            Arc::clone(&self.messages),
            Arc::clone(&self.routers),
            Arc::clone(&self.clients),
            Arc::clone(&transport),
        ));

        let tickers = vec![
            Ticker::spawn(Arc::clone(&self.clients), self.config.clients.resolution()),
            Ticker::spawn(Arc::clone(&self.messages), self.config.messages.resolution()),
            Ticker::spawn(Arc::clone(&self.routers), self.config.routers.resolution()),
        ];

        let service = Arc::new(RouterService::new(
            Arc::clone(&flood),
            Arc::clone(&self.clients),
            Arc::clone(&self.routers),
            Arc::clone(&transport),
        ));
        let server = Server::start(listeners, service, ServerLimits::new(self.config.max_workers))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let directory = Arc::new(DirectoryClient::new(
            self.config.directory_address.clone(),
            self.config.directory_port,
        ));
        let schedule = RefreshSchedule {
            outdegree: self.config.outdegree,
            listen_port: self.config.listen_port,
            interval: self.config.router_refresh_interval(),
            retry_interval: self.config.directory_retry_interval(),
        };
        let tasks = vec![
            tokio::spawn(keepalive_loop(
                Arc::clone(&directory),
                transport,
                self.config.listen_port,
                self.config.keepalive_interval(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(router_refresh_loop(
                directory,
                Arc::clone(&self.routers),
                schedule,
                shutdown_rx,
            )),
        ];

        tracing::info!(
            address = %server.local_addr(),
            directory = %format!("{}:{}", self.config.directory_address, self.config.directory_port),
            hop_limit = self.config.hop_limit,
            "router started"
        );
        self.running = Some(Running {
            flood,
            server,
            _tickers: tickers,
            shutdown,
            tasks,
        });
        self.state = NodeState::Running;
        Ok(())
    }

    /// Stop serving and say goodbye to the directory
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not running.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Err(self.invalid_state("stop"));
        };

        // Keep-alive loop sends its disconnect before exiting
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            let _ = task.await;
        }
        running.server.shutdown().await;

        self.state = NodeState::Stopped;
        tracing::info!("router stopped");
        Ok(())
    }

    /// Flood a locally originated payload
    ///
    /// The envelope gets a fresh id and zero hops, and no router is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not running, or
    /// `ProtocolError::MessageTooLarge` if the encoded envelope would not fit
    /// in one datagram.
    pub async fn broadcast(&self, payload: Map<String, Value>) -> Result<BroadcastReceipt> {
        let Some(running) = &self.running else {
            return Err(self.invalid_state("broadcast"));
        };

        let envelope = FloodEnvelope::originate(payload);
        let size = envelope.encode().len();
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(size, MAX_MESSAGE_SIZE).into());
        }
        let id = envelope.id.clone();
        let outcome = running.flood.handle(envelope, None).await;
        tracing::debug!(id = %id, ?outcome, "broadcast originated");
        Ok(BroadcastReceipt { id, outcome })
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Address the node listens on, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.server.local_addr())
    }

    /// Effective configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Locally registered clients
    pub fn clients(&self) -> &Arc<PeerTable> {
        &self.clients
    }

    /// Routers learned from the directory
    pub fn routers(&self) -> &Arc<PeerTable> {
        &self.routers
    }

    /// Recently flooded message ids
    pub fn messages(&self) -> &Arc<MessageCache> {
        &self.messages
    }

    fn invalid_state(&self, operation: &'static str) -> FloodnetError {
        FloodnetError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }
}
