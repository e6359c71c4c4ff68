//! Directory server
//!
//! Routers register themselves with UDP `connect` keep-alives and learn about
//! each other through TCP `list` and `discover` requests. A registration that
//! is not refreshed within the peer TTL disappears on its own.

use crate::api::config::DirectoryConfig;
use crate::cache::Ticker;
use crate::error::Result;
use crate::network::{Listeners, Server, ServerLimits, Service};
use crate::protocol::{ErrorCode, Request, Response};
use crate::routing::PeerTable;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Name reported by `info`
pub const DIRECTORY_NAME: &str = "floodnet directory";

/// Request handling for a directory
pub struct DirectoryService {
    peers: Arc<PeerTable>,
}

impl DirectoryService {
    /// Serve requests against `peers`
    pub fn new(peers: Arc<PeerTable>) -> Self {
        Self { peers }
    }

    /// Registered routers
    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }
}

impl Service for DirectoryService {
    async fn handle_request(&self, request: Request, peer: SocketAddr) -> Option<Response> {
        let response = match request {
            Request::List { num } => Response::json(&self.peers.list_json(num, None)),
            Request::Discover { num, port: Some(port) } => {
                let caller = SocketAddr::new(peer.ip(), port);
                Response::json(&self.peers.list_json(num, Some(caller)))
            },
            Request::Discover { port: None, .. } => Ok(Response::Error(ErrorCode::NoPort)),
            Request::Info => Response::json(&json!({
                "name": DIRECTORY_NAME,
                "routers": self.peers.len(),
            })),
            other => {
                tracing::debug!(peer = %peer, method = other.method(), "method not served over tcp");
                Ok(Response::Error(ErrorCode::BadMethod))
            },
        };
        Some(response.unwrap_or_else(Response::from))
    }

    async fn handle_datagram(&self, request: Request, peer: SocketAddr) {
        let outcome = match &request {
            Request::Connect { port } => self.peers.register_peer(peer.ip(), port).map(|_| ()),
            Request::Disconnect { port } => self.peers.unregister_peer(peer.ip(), port).map(|_| ()),
            other => {
                tracing::debug!(peer = %peer, method = other.method(), "method not served over udp");
                return;
            },
        };
        if let Err(e) = outcome {
            tracing::debug!(peer = %peer, method = request.method(), error = %e, "datagram rejected");
        }
    }
}

/// A running directory
///
/// Owns the peer table, the ticker expiring it and the dispatch loops.
pub struct Directory {
    service: Arc<DirectoryService>,
    server: Server,
    _ticker: Ticker,
}

impl Directory {
    /// Bind on all IPv4 interfaces at the configured port and start serving
    pub async fn start(config: &DirectoryConfig) -> Result<Self> {
        Self::start_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config).await
    }

    /// Bind on `ip` at the configured port and start serving
    pub async fn start_on(ip: IpAddr, config: &DirectoryConfig) -> Result<Self> {
        config.validate()?;
        let listeners = Listeners::bind(ip, config.listen_port).await?;
        Self::serve(listeners, config)
    }

    /// Start serving on already bound sockets
    pub fn serve(listeners: Listeners, config: &DirectoryConfig) -> Result<Self> {
        config.validate()?;
        let peers = Arc::new(PeerTable::new("routers", &config.peers));
        let ticker = Ticker::spawn(Arc::clone(&peers), config.peers.resolution());
        let service = Arc::new(DirectoryService::new(peers));
        let server = Server::start(listeners, Arc::clone(&service), ServerLimits::new(config.max_workers))?;

        tracing::info!(
            address = %server.local_addr(),
            peer_ttl = ?config.peers.lifetime(),
            "directory started"
        );
        Ok(Self {
            service,
            server,
            _ticker: ticker,
        })
    }

    /// Address the directory listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Registered routers
    pub fn peers(&self) -> &Arc<PeerTable> {
        self.service.peers()
    }

    /// Stop serving
    pub async fn shutdown(self) {
        self.server.shutdown().await;
        tracing::info!("directory stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerJson;
    use crate::protocol::response::trim_body;

    fn service() -> DirectoryService {
        DirectoryService::new(Arc::new(PeerTable::with_ttl("routers", 10, 8)))
    }

    fn caller(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    fn body(response: Option<Response>) -> Vec<u8> {
        match response {
            Some(Response::Body(body)) => body,
            other => panic!("expected a body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_registers_caller_ip() {
        let directory = service();
        directory
            .handle_datagram(
                Request::Connect {
                    port: "4000".to_string(),
                },
                caller("10.0.0.5:31337"),
            )
            .await;

        assert!(directory.peers().contains(&caller("10.0.0.5:4000")));
    }

    #[tokio::test]
    async fn test_bad_port_is_ignored() {
        let directory = service();
        directory
            .handle_datagram(
                Request::Connect {
                    port: "70000".to_string(),
                },
                caller("10.0.0.5:31337"),
            )
            .await;

        assert!(directory.peers().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_removes_registration() {
        let directory = service();
        directory.peers().register(caller("10.0.0.5:4000"));
        directory
            .handle_datagram(
                Request::Disconnect {
                    port: "4000".to_string(),
                },
                caller("10.0.0.5:999"),
            )
            .await;

        assert!(directory.peers().is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_peer_json() {
        let directory = service();
        directory.peers().register(caller("10.0.0.5:4000"));

        let body = body(directory.handle_request(Request::List { num: 10 }, caller("10.0.0.9:1")).await);
        let peers: Vec<PeerJson> = serde_json::from_slice(trim_body(&body)).unwrap();
        assert_eq!(
            peers,
            vec![PeerJson {
                ip: "10.0.0.5".to_string(),
                port: 4000,
                ipv: 4
            }]
        );
    }

    #[tokio::test]
    async fn test_discover_excludes_caller() {
        let directory = service();
        directory.peers().register(caller("10.0.0.5:4000"));
        directory.peers().register(caller("10.0.0.6:4000"));

        let body = body(
            directory
                .handle_request(
                    Request::Discover {
                        num: 10,
                        port: Some(4000),
                    },
                    caller("10.0.0.5:50000"),
                )
                .await,
        );
        assert_eq!(PeerJson::parse_list(&body).unwrap(), vec![caller("10.0.0.6:4000")]);
    }

    #[tokio::test]
    async fn test_discover_without_port() {
        let response = service()
            .handle_request(Request::Discover { num: 1, port: None }, caller("10.0.0.5:1"))
            .await;
        assert_eq!(response, Some(Response::Error(ErrorCode::NoPort)));
    }

    #[tokio::test]
    async fn test_info_counts_routers() {
        let directory = service();
        directory.peers().register(caller("10.0.0.5:4000"));

        let body = body(directory.handle_request(Request::Info, caller("10.0.0.9:1")).await);
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info, json!({"name": "floodnet directory", "routers": 1}));
    }

    #[tokio::test]
    async fn test_router_methods_rejected() {
        let response = service().handle_request(Request::Ip, caller("10.0.0.5:1")).await;
        assert_eq!(response, Some(Response::Error(ErrorCode::BadMethod)));
        assert!(response.unwrap().closes_connection());
    }
}
