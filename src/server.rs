//! Raw TCP echo server.
//!
//! Reads whatever arrives on a connection (up to one buffer at a time) and
//! writes it straight back. There is no framing: a reply is exactly the
//! chunk that was read. Used as a local benchmark target and by the tests.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Read buffer size
const BUFFER_SIZE: usize = 4096;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind a new server. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(address = %self.local_addr()?, "Echo server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Echo every chunk back until the client closes.
async fn handle_connection(mut stream: TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buffer.clear();
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }
        stream.write_all(&buffer).await?;
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start() -> SocketAddr {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_binds_ephemeral_port() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_echoes_bytes() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        for msg in [&b"hello\n"[..], &b"ping"[..], &b"a longer message\r\n"[..]] {
            stream.write_all(msg).await.unwrap();
            let mut reply = vec![0u8; msg.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, msg);
        }
    }

    #[tokio::test]
    async fn test_payload_larger_than_buffer() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let payload: Vec<u8> = (0..BUFFER_SIZE * 3).map(|i| (i % 251) as u8).collect();
        stream.write_all(&payload).await.unwrap();
        let mut reply = vec![0u8; payload.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, payload);
    }

    #[tokio::test]
    async fn test_concurrent_clients() {
        let addr = start().await;

        let clients: Vec<_> = (0..16u8)
            .map(|i| {
                tokio::spawn(async move {
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    let msg = [i; 32];
                    stream.write_all(&msg).await.unwrap();
                    let mut reply = [0u8; 32];
                    stream.read_exact(&mut reply).await.unwrap();
                    assert_eq!(reply, msg);
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }
    }
}
