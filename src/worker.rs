//! A single benchmark connection.
//!
//! Each worker owns one TCP connection and runs a strictly sequential
//! request/reply loop on it:
//!
//! ```text
//! connecting -> looping -> closed
//!      \           \
//!       +-----------+----> failed
//! ```
//!
//! Failures are terminal for the worker and never reach other workers.
//! Iterations finished before a failure still count as completed.

use crate::config::Config;
use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Per-run settings shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub payload: Bytes,
    pub iterations: u64,
    pub read_buffer_size: usize,
    pub verify: bool,
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
}

impl From<&Config> for WorkerOptions {
    fn from(config: &Config) -> Self {
        Self {
            payload: config.payload.clone(),
            iterations: config.iterations,
            read_buffer_size: config.read_buffer_size,
            verify: config.verify,
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
        }
    }
}

/// Outcome of one worker.
#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    /// Round-trips finished before the worker stopped.
    pub completed: u64,
    pub error: Option<WorkerError>,
}

impl WorkerReport {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Run one worker to completion against `addr`.
pub async fn run(id: usize, addr: SocketAddr, options: &WorkerOptions) -> WorkerReport {
    let mut stream = match connect(addr, options.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(worker = id, error = %e, "Connect failed");
            return WorkerReport {
                id,
                completed: 0,
                error: Some(e),
            };
        }
    };
    trace!(worker = id, peer = %addr, "Connected");

    let mut completed = 0;
    let error = match exchange(&mut stream, options, &mut completed).await {
        Ok(()) => {
            // Close our side; the peer may already be gone.
            let _ = stream.shutdown().await;
            None
        }
        Err(e) => {
            debug!(worker = id, completed, error = %e, "Worker stopped early");
            Some(e)
        }
    };

    WorkerReport {
        id,
        completed,
        error,
    }
}

async fn connect(addr: SocketAddr, limit: Option<Duration>) -> Result<TcpStream, WorkerError> {
    let stream = with_timeout(limit, Phase::Connect, async {
        TcpStream::connect(addr).await.map_err(WorkerError::Connect)
    })
    .await?;
    stream.set_nodelay(true).map_err(WorkerError::Connect)?;
    Ok(stream)
}

/// The request loop. `completed` is updated after every finished
/// round-trip so the caller sees partial progress on error.
async fn exchange<S>(
    stream: &mut S,
    options: &WorkerOptions,
    completed: &mut u64,
) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = &options.payload[..];
    let mut read_buf = BytesMut::with_capacity(options.read_buffer_size);
    let mut reply = BytesMut::with_capacity(payload.len());

    for _ in 0..options.iterations {
        with_timeout(options.io_timeout, Phase::Write, async {
            stream.write_all(payload).await.map_err(WorkerError::Write)
        })
        .await?;

        if options.verify {
            reply.clear();
            with_timeout(
                options.io_timeout,
                Phase::Read,
                read_echo(stream, payload, &mut reply),
            )
            .await?;
        } else {
            // One chunk of at most `read_buffer_size` bytes, whatever it holds.
            read_buf.clear();
            let mut chunk = (&mut read_buf).limit(options.read_buffer_size);
            let n = with_timeout(options.io_timeout, Phase::Read, async {
                stream.read_buf(&mut chunk).await.map_err(WorkerError::Read)
            })
            .await?;
            if n == 0 {
                return Err(WorkerError::Closed);
            }
        }

        *completed += 1;
    }

    Ok(())
}

/// Read until `reply` holds as many bytes as `payload`, failing as soon as
/// the bytes received stop matching.
async fn read_echo<S>(
    stream: &mut S,
    payload: &[u8],
    reply: &mut BytesMut,
) -> Result<(), WorkerError>
where
    S: AsyncRead + Unpin,
{
    while reply.len() < payload.len() {
        let n = stream.read_buf(reply).await.map_err(WorkerError::Read)?;
        if n == 0 {
            return Err(WorkerError::Closed);
        }
        if !payload.starts_with(&reply[..]) {
            return Err(WorkerError::Mismatch {
                expected: payload.len(),
                received: reply.len(),
            });
        }
    }
    Ok(())
}

async fn with_timeout<T, F>(limit: Option<Duration>, phase: Phase, fut: F) -> Result<T, WorkerError>
where
    F: Future<Output = Result<T, WorkerError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| WorkerError::Timeout(phase))?,
        None => fut.await,
    }
}

/// Where in the loop a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Write,
    Read,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Write => write!(f, "write"),
            Phase::Read => write!(f, "read"),
        }
    }
}

/// Worker failures. All of them end the worker.
#[derive(Debug)]
pub enum WorkerError {
    Connect(io::Error),
    Write(io::Error),
    Read(io::Error),
    Timeout(Phase),
    /// Peer closed the connection before replying.
    Closed,
    /// Reply did not match the payload (only with verification on).
    Mismatch { expected: usize, received: usize },
    /// The worker task panicked or was cancelled.
    Aborted,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Connect(e) => write!(f, "connect failed: {e}"),
            WorkerError::Write(e) => write!(f, "write failed: {e}"),
            WorkerError::Read(e) => write!(f, "read failed: {e}"),
            WorkerError::Timeout(phase) => write!(f, "{phase} timed out"),
            WorkerError::Closed => write!(f, "connection closed by peer"),
            WorkerError::Mismatch { expected, received } => write!(
                f,
                "reply does not match payload ({received} of {expected} bytes received)"
            ),
            WorkerError::Aborted => write!(f, "worker aborted"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Connect(e) | WorkerError::Write(e) | WorkerError::Read(e) => Some(e),
            _ => None,
        }
    }
}
