//! TCP and UDP dispatch loops
//!
//! Both loops hand each connection or datagram to its own task, up to a shared
//! worker ceiling. Work arriving while the ceiling is reached is dropped, not
//! queued.

use crate::error::{NetworkError, Result};
use crate::network::connection::Connection;
use crate::protocol::{ErrorCode, Request, Response, MAX_MESSAGE_SIZE};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Default time allowed for one request to arrive
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Request handling for one kind of node
pub trait Service: Send + Sync + 'static {
    /// Answer a request received over TCP
    ///
    /// `None` sends nothing back.
    fn handle_request(
        &self,
        request: Request,
        peer: SocketAddr,
    ) -> impl Future<Output = Option<Response>> + Send;

    /// Handle a request received as a UDP datagram
    fn handle_datagram(&self, request: Request, peer: SocketAddr) -> impl Future<Output = ()> + Send;
}

/// Limits applied by the dispatch loops
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    /// Concurrent connection and datagram handlers
    pub max_workers: usize,
    /// Time allowed for each TCP request to arrive
    pub read_timeout: Duration,
}

impl ServerLimits {
    /// Limits with the given worker ceiling and the default timeout
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// TCP listener and UDP socket bound to the same port
pub struct Listeners {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
}

impl Listeners {
    /// Bind both sockets
    ///
    /// With `port` 0 the TCP listener picks a free port and the UDP socket
    /// binds the same number.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let bind_failed = |address: SocketAddr, e: std::io::Error| NetworkError::BindFailed {
            address: address.to_string(),
            reason: e.to_string(),
        };

        let requested = SocketAddr::new(ip, port);
        let tcp = TcpListener::bind(requested)
            .await
            .map_err(|e| bind_failed(requested, e))?;
        let bound = tcp.local_addr()?;
        let udp = UdpSocket::bind(bound)
            .await
            .map_err(|e| bind_failed(bound, e))?;

        Ok(Self {
            tcp,
            udp: Arc::new(udp),
        })
    }

    /// Address both sockets are bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// The UDP socket, for sending from the listen port
    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.udp)
    }
}

/// Running TCP and UDP loops for one service
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Start serving on already bound listeners
    pub fn start<S: Service>(listeners: Listeners, service: Arc<S>, limits: ServerLimits) -> Result<Self> {
        let local_addr = listeners.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(limits.max_workers.max(1)));

        let tcp = tokio::spawn(serve_tcp(
            listeners.tcp,
            Arc::clone(&service),
            Arc::clone(&workers),
            limits.read_timeout,
            shutdown_rx.clone(),
        ));
        let udp = tokio::spawn(serve_udp(listeners.udp, service, workers, shutdown_rx));

        tracing::info!(address = %local_addr, max_workers = limits.max_workers, "listening");
        Ok(Self {
            local_addr,
            shutdown,
            tasks: vec![tcp, udp],
        })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting work and wait for both loops to exit
    ///
    /// Handlers already running are left to finish on their own.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_tcp<S: Service>(
    listener: TcpListener,
    service: Arc<S>,
    workers: Arc<Semaphore>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            },
        };

        let Ok(permit) = Arc::clone(&workers).try_acquire_owned() else {
            tracing::warn!(peer = %peer, "worker limit reached, closing connection");
            continue;
        };

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            handle_connection(stream, peer, service.as_ref(), read_timeout).await;
            drop(permit);
        });
    }
    tracing::debug!("tcp loop stopped");
}

async fn handle_connection<S: Service>(stream: TcpStream, peer: SocketAddr, service: &S, read_timeout: Duration) {
    let mut connection = Connection::new(stream, peer);
    tracing::trace!(peer = %peer, "connection opened");

    loop {
        let message = match tokio::time::timeout(read_timeout, connection.read_message()).await {
            Err(_) => {
                tracing::debug!(peer = %peer, "read timed out");
                break;
            },
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "read failed");
                let _ = connection.send(&Response::Error(ErrorCode::NoMethod).encode()).await;
                break;
            },
        };

        let response = match Request::parse(&message) {
            Ok(request) => service.handle_request(request, peer).await,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "bad request");
                Some(Response::from(e))
            },
        };

        let Some(response) = response else {
            continue;
        };
        if let Err(e) = connection.send(&response.encode()).await {
            tracing::debug!(peer = %peer, error = %e, "reply failed");
            break;
        }
        if response.closes_connection() {
            break;
        }
    }

    connection.close().await;
    tracing::trace!(peer = %peer, "connection closed");
}

async fn serve_udp<S: Service>(
    socket: Arc<UdpSocket>,
    service: Arc<S>,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    // One spare byte tells an oversized datagram apart from one at the cap
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown.changed() => break,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!(error = %e, "recv failed");
                continue;
            },
        };

        let request = match Request::parse(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "datagram dropped");
                continue;
            },
        };

        let Ok(permit) = Arc::clone(&workers).try_acquire_owned() else {
            tracing::warn!(peer = %peer, "worker limit reached, dropping datagram");
            continue;
        };

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service.handle_datagram(request, peer).await;
            drop(permit);
        });
    }
    tracing::debug!("udp loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseHeader;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Echo {
        datagrams: Mutex<Vec<(Request, SocketAddr)>>,
        received: Notify,
        gate: Option<Arc<Notify>>,
    }

    impl Service for Echo {
        async fn handle_request(&self, request: Request, _peer: SocketAddr) -> Option<Response> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match request {
                Request::Ping { .. } => Some(Response::Okay),
                Request::Info => Response::json(&serde_json::json!({"name": "echo"})).ok(),
                Request::Pong => None,
                _ => Some(Response::Error(ErrorCode::BadMethod)),
            }
        }

        async fn handle_datagram(&self, request: Request, peer: SocketAddr) {
            self.datagrams.lock().push((request, peer));
            self.received.notify_one();
        }
    }

    async fn start(service: Echo, max_workers: usize) -> (Server, Arc<Echo>) {
        let listeners = Listeners::bind("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        let service = Arc::new(service);
        let server = Server::start(listeners, Arc::clone(&service), ServerLimits::new(max_workers)).unwrap();
        (server, service)
    }

    async fn round_trip(connection: &mut Connection, request: &[u8]) -> ResponseHeader {
        connection.send(request).await.unwrap();
        let header = connection.read_message().await.unwrap().unwrap();
        ResponseHeader::parse(&header).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_request_loop() {
        let (server, _) = start(Echo::default(), 4).await;
        let mut connection = Connection::connect(server.local_addr()).await.unwrap();

        let header = round_trip(&mut connection, b"{\"method\":\"ping\"}\r\n\r\n").await;
        assert_eq!(header, ResponseHeader::Okay { size: None });

        let header = round_trip(&mut connection, b"{\"method\":\"info\"}\r\n\r\n").await;
        let ResponseHeader::Okay { size: Some(size) } = header else {
            panic!("expected a sized reply, got {header:?}");
        };
        let body = connection.read_exact(size).await.unwrap();
        assert_eq!(body, b"{\"name\":\"echo\"}\r\n\r\n");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_argument_error_keeps_connection_open() {
        let (server, _) = start(Echo::default(), 4).await;
        let mut connection = Connection::connect(server.local_addr()).await.unwrap();

        let header = round_trip(&mut connection, b"{\"method\":\"list\"}\r\n\r\n").await;
        assert!(matches!(header, ResponseHeader::Error { code: 1, .. }));

        let header = round_trip(&mut connection, b"{\"method\":\"ping\"}\r\n\r\n").await;
        assert_eq!(header, ResponseHeader::Okay { size: None });
    }

    #[tokio::test]
    async fn test_method_error_closes_connection() {
        let (server, _) = start(Echo::default(), 4).await;
        let mut connection = Connection::connect(server.local_addr()).await.unwrap();

        let header = round_trip(&mut connection, b"not json\r\n\r\n").await;
        assert!(matches!(header, ResponseHeader::Error { code: 0, .. }));
        assert!(connection.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_udp_datagrams_dispatched() {
        let (server, service) = start(Echo::default(), 4).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"garbage", server.local_addr()).await.unwrap();
        client
            .send_to(b"{\"method\":\"connect\",\"port\":4000}", server.local_addr())
            .await
            .unwrap();
        service.received.notified().await;

        let datagrams = service.datagrams.lock();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(
            datagrams[0].0,
            Request::Connect {
                port: "4000".to_string()
            }
        );
        assert_eq!(datagrams[0].1, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_worker_limit_rejects_overflow() {
        let gate = Arc::new(Notify::new());
        let echo = Echo {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let (server, _) = start(echo, 1).await;

        // First connection occupies the only worker
        let mut busy = Connection::connect(server.local_addr()).await.unwrap();
        busy.send(b"{\"method\":\"ping\"}\r\n\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut rejected = Connection::connect(server.local_addr()).await.unwrap();
        rejected.send(b"{\"method\":\"ping\"}\r\n\r\n").await.ok();
        let outcome = rejected.read_message().await;
        assert!(matches!(outcome, Ok(None) | Err(_)));

        gate.notify_one();
        let header = busy.read_message().await.unwrap().unwrap();
        assert_eq!(ResponseHeader::parse(&header).unwrap(), ResponseHeader::Okay { size: None });
    }
}
