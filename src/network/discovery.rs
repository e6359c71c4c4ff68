//! Directory client and router discovery loops
//!
//! Routers find each other through a directory:
//! - a keep-alive loop sends UDP `connect` so the directory keeps listing us
//! - a refresh loop asks the directory to `discover` other routers and
//!   replaces the local router set with the answer
//!
//! [`DirectoryClient`] also speaks the TCP request/reply protocol to any
//! router, which is handy for `ping`, `ip` and `info`.

use crate::error::{NetworkError, Result};
use crate::network::connection::Connection;
use crate::network::transport::Transport;
use crate::protocol::response::{parse_body, trim_body};
use crate::protocol::{PeerJson, Request, ResponseHeader};
use crate::routing::PeerTable;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default time allowed for a whole request/reply exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the TCP request/reply protocol
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl DirectoryClient {
    /// Client for the server at `host:port`
    ///
    /// `host` may be a name; it is resolved on every request.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the exchange timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port` as configured
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the server address
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let endpoint = self.endpoint();
        let mut addrs = tokio::net::lookup_host(endpoint.as_str())
            .await
            .map_err(|_| NetworkError::InvalidAddress {
                address: endpoint.clone(),
            })?;
        match addrs.next() {
            Some(addr) => Ok(addr),
            None => Err(NetworkError::InvalidAddress { address: endpoint.clone() }.into()),
        }
    }

    /// Send one request and collect the reply body, if any
    ///
    /// # Errors
    ///
    /// `NetworkError::RemoteError` when the server answers with an error
    /// status, `NetworkError::Timeout` when the exchange takes too long.
    pub async fn request(&self, request: &Request) -> Result<Option<Vec<u8>>> {
        let address = self.resolve().await?;
        tokio::time::timeout(self.timeout, exchange(address, request))
            .await
            .map_err(|_| NetworkError::Timeout {
                address: address.to_string(),
            })?
    }

    /// Up to `num` registered peers
    pub async fn list(&self, num: usize) -> Result<Vec<SocketAddr>> {
        self.peer_list(&Request::List { num }).await
    }

    /// Up to `num` peers other than the caller listening on `port`
    pub async fn discover(&self, num: usize, port: u16) -> Result<Vec<SocketAddr>> {
        self.peer_list(&Request::Discover {
            num,
            port: Some(port),
        })
        .await
    }

    /// Service description
    pub async fn info(&self) -> Result<Value> {
        let body = self.request(&Request::Info).await?.unwrap_or_default();
        Ok(parse_body(&body)?)
    }

    /// Our address as the server sees it
    pub async fn ip(&self) -> Result<String> {
        let body = self.request(&Request::Ip).await?.unwrap_or_default();
        let value = parse_body(&body)?;
        value
            .get("ip")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                NetworkError::ReceiveFailed {
                    reason: "reply has no 'ip' field".to_string(),
                }
                .into()
            })
    }

    /// Liveness check
    pub async fn ping(&self) -> Result<()> {
        self.request(&Request::Ping { port: None }).await?;
        Ok(())
    }

    /// Register or refresh ourselves, listening on `port`
    pub async fn connect<T: Transport + ?Sized>(&self, transport: &T, port: u16) -> Result<()> {
        self.datagram(transport, &Request::Connect {
            port: port.to_string(),
        })
        .await
    }

    /// Remove our registration at `port`
    pub async fn disconnect<T: Transport + ?Sized>(&self, transport: &T, port: u16) -> Result<()> {
        self.datagram(transport, &Request::Disconnect {
            port: port.to_string(),
        })
        .await
    }

    async fn datagram<T: Transport + ?Sized>(&self, transport: &T, request: &Request) -> Result<()> {
        let address = self.resolve().await?;
        transport.send_to(&request.encode(), address).await
    }

    async fn peer_list(&self, request: &Request) -> Result<Vec<SocketAddr>> {
        match self.request(request).await? {
            Some(body) => Ok(PeerJson::parse_list(trim_body(&body))?),
            None => Ok(Vec::new()),
        }
    }
}

async fn exchange(address: SocketAddr, request: &Request) -> Result<Option<Vec<u8>>> {
    let mut connection = Connection::connect(address).await?;
    connection.send(&request.encode()).await?;

    let header = connection
        .read_message()
        .await?
        .ok_or(NetworkError::ConnectionReset)?;

    let body = match ResponseHeader::parse(&header)? {
        ResponseHeader::Error { code, reason } => {
            return Err(NetworkError::RemoteError { code, reason }.into());
        },
        ResponseHeader::Okay { size: None } => None,
        ResponseHeader::Okay { size: Some(size) } => Some(connection.read_exact(size).await?),
    };

    connection.close().await;
    Ok(body)
}

/// Send a `connect` keep-alive every `interval` until shutdown
///
/// The first keep-alive goes out immediately. On shutdown a `disconnect` is
/// sent so the directory forgets us without waiting for the TTL.
pub async fn keepalive_loop<T: Transport + ?Sized>(
    client: Arc<DirectoryClient>,
    transport: Arc<T>,
    listen_port: u16,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = client.connect(transport.as_ref(), listen_port).await {
            tracing::warn!(directory = %client.endpoint(), error = %e, "keep-alive failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.changed() => break,
        }
    }

    if let Err(e) = client.disconnect(transport.as_ref(), listen_port).await {
        tracing::warn!(directory = %client.endpoint(), error = %e, "disconnect failed");
    }
}

/// Timing of the router refresh loop
#[derive(Debug, Clone, Copy)]
pub struct RefreshSchedule {
    /// Routers to ask for
    pub outdegree: usize,
    /// Our listen port, so the directory can leave us out
    pub listen_port: u16,
    /// Wait after a successful refresh
    pub interval: Duration,
    /// Wait after a failed refresh
    pub retry_interval: Duration,
}

/// Replace `routers` with a fresh `discover` answer on a schedule
///
/// The first refresh runs immediately.
pub async fn router_refresh_loop(
    client: Arc<DirectoryClient>,
    routers: Arc<PeerTable>,
    schedule: RefreshSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let wait = match refresh_routers(&client, &routers, &schedule).await {
            Ok(count) => {
                tracing::debug!(routers = count, "router set refreshed");
                schedule.interval
            },
            Err(e) => {
                tracing::warn!(
                    directory = %client.endpoint(),
                    error = %e,
                    retry_in = ?schedule.retry_interval,
                    "router refresh failed"
                );
                schedule.retry_interval
            },
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {},
            _ = shutdown.changed() => break,
        }
    }
}

/// One refresh: ask the directory and swap in the answer
pub async fn refresh_routers(
    client: &DirectoryClient,
    routers: &PeerTable,
    schedule: &RefreshSchedule,
) -> Result<usize> {
    let found = client.discover(schedule.outdegree, schedule.listen_port).await?;
    let count = found.len();
    routers.replace(found);
    Ok(count)
}
