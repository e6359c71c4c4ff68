//! Delimited message framing over byte streams
//!
//! Requests and reply headers end with `\r\n\r\n`. Reply bodies are sized by
//! their header instead, so the reader also supports exact-length reads that
//! draw from the same buffer.

use crate::error::{NetworkError, Result};
use crate::protocol::{MAX_MESSAGE_SIZE, MESSAGE_DELIMITER};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 512;

/// A stream that reads and writes delimited messages
pub struct Connection<S = TcpStream> {
    stream: S,
    peer_addr: SocketAddr,
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Connection<TcpStream> {
    /// Open a TCP connection
    pub async fn connect(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(stream, address))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream
    pub fn new(stream: S, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            buffer: Vec::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Override the size cap for delimited reads
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the next delimited message, without its delimiter
    ///
    /// Returns `Ok(None)` when the peer closes the stream between messages.
    ///
    /// # Errors
    ///
    /// - `NetworkError::MessageTooLarge` if no delimiter shows up within the
    ///   size cap
    /// - `NetworkError::ConnectionReset` if the stream ends mid-message
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scanned = 0;
        loop {
            if let Some(end) = find_delimiter(&self.buffer, scanned) {
                let mut message: Vec<u8> =
                    self.buffer.drain(..end + MESSAGE_DELIMITER.len()).collect();
                message.truncate(end);
                return Ok(Some(message));
            }
            if self.buffer.len() > self.max_message_size {
                return Err(NetworkError::MessageTooLarge {
                    size: self.buffer.len(),
                    max: self.max_message_size,
                }
                .into());
            }
            scanned = self.buffer.len().saturating_sub(MESSAGE_DELIMITER.len() - 1);

            if self.fill().await? == 0 {
                if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    self.buffer.clear();
                    return Ok(None);
                }
                return Err(NetworkError::ConnectionReset.into());
            }
        }
    }

    /// Read exactly `len` bytes
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < len {
            if self.fill().await? == 0 {
                return Err(NetworkError::ConnectionReset.into());
            }
        }
        Ok(self.buffer.drain(..len).collect())
    }

    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| NetworkError::ReceiveFailed {
                reason: e.to_string(),
            })?;
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Write bytes and flush
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let address = self.peer_addr;
        let fail = |e: std::io::Error| NetworkError::SendFailed {
            address,
            reason: e.to_string(),
        };
        self.stream.write_all(bytes).await.map_err(fail)?;
        self.stream.flush().await.map_err(fail)?;
        Ok(())
    }

    /// Shut down the write half
    pub async fn close(&mut self) {
        // Peer may already be gone
        let _ = self.stream.shutdown().await;
    }
}

fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(MESSAGE_DELIMITER.len())
        .position(|window| window == MESSAGE_DELIMITER)
        .map(|pos| from + pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodnetError;
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_reads_pipelined_messages() {
        let (client, server) = duplex(1024);
        let mut reader = Connection::new(server, peer());
        let mut writer = Connection::new(client, peer());

        writer.send(b"{\"a\":1}\r\n\r\n{\"b\":2}\r\n\r\n").await.unwrap();
        assert_eq!(reader.read_message().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(reader.read_message().await.unwrap().unwrap(), b"{\"b\":2}");
    }

    #[tokio::test]
    async fn test_delimiter_split_across_reads() {
        let (client, server) = duplex(1024);
        let mut reader = Connection::new(server, peer());
        let mut writer = Connection::new(client, peer());

        let task = tokio::spawn(async move {
            writer.send(b"{\"a\":1}\r\n").await.unwrap();
            tokio::task::yield_now().await;
            writer.send(b"\r\n").await.unwrap();
            writer
        });

        assert_eq!(reader.read_message().await.unwrap().unwrap(), b"{\"a\":1}");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_is_none() {
        let (client, server) = duplex(1024);
        let mut reader = Connection::new(server, peer());
        drop(client);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_message_is_reset() {
        let (client, server) = duplex(1024);
        let mut reader = Connection::new(server, peer());
        let mut writer = Connection::new(client, peer());
        writer.send(b"{\"method\":").await.unwrap();
        drop(writer);

        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FloodnetError::Network(NetworkError::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_oversized_message() {
        let (client, server) = duplex(4096);
        let mut reader = Connection::new(server, peer()).with_max_message_size(64);
        let mut writer = Connection::new(client, peer());
        writer.send(&[b'x'; 200]).await.unwrap();

        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            FloodnetError::Network(NetworkError::MessageTooLarge { max: 64, .. })
        ));
    }

    #[tokio::test]
    async fn test_header_then_sized_body() {
        let (client, server) = duplex(1024);
        let mut reader = Connection::new(server, peer());
        let mut writer = Connection::new(client, peer());
        writer
            .send(b"{\"status\":\"okay\",\"size\":6}\r\n\r\n[]\r\n\r\n")
            .await
            .unwrap();

        let header = reader.read_message().await.unwrap().unwrap();
        assert_eq!(header, b"{\"status\":\"okay\",\"size\":6}");
        assert_eq!(reader.read_exact(6).await.unwrap(), b"[]\r\n\r\n");
    }
}
