//! Network module
//!
//! Sockets, framing and the request dispatch loops shared by directories and
//! routers. Requests arrive over TCP (request/reply) or UDP (fire-and-forget)
//! on the same port.

pub mod connection;
pub mod discovery;
pub mod server;
pub mod transport;

pub use connection::Connection;
pub use discovery::{DirectoryClient, RefreshSchedule};
pub use server::{Listeners, Server, ServerLimits, Service};
pub use transport::{Datagram, MemoryNetwork, MemoryTransport, Transport, UdpTransport};
