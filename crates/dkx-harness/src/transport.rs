//! Line transports and the sliced key/value channel on top of them.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::trace;

use crate::kv::{self, KvError, KvLine, ValueAssembler};

/// Longest line a [`LineTransport`] buffers, terminator included.
pub const DEFAULT_MAX_LINE_LEN: usize = 8 * 1024;

/// TCP line transport, as produced by [`Acceptor`] for a `TcpListener`.
pub type TcpLineTransport = LineTransport<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the connection
    #[error("peer disconnected")]
    Disconnected,

    /// No complete value arrived in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// A bidirectional channel of text lines.
#[async_trait]
pub trait KvTransport: Send {
    /// Send one line; the transport adds the line terminator.
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Receive one line without its terminator.
    async fn recv_line(&mut self) -> Result<String, TransportError>;
}

// ============================================================================
// Stream transport
// ============================================================================

/// Newline-delimited lines over any async reader/writer pair.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    max_line_len: usize,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    /// Refuse lines longer than `max_line_len` bytes instead of buffering them.
    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }
}

impl TcpLineTransport {
    /// Line transport over a TCP connection.
    pub fn tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(BufReader::new(read_half), write_half)
    }
}

impl LineTransport<BufReader<Stdin>, Stdout> {
    /// Line transport over the process's stdin and stdout, for running under
    /// a test host that owns the other end.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

#[async_trait]
impl<R, W> KvTransport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let limit = self.max_line_len as u64;
        let read = (&mut self.reader).take(limit).read_line(&mut line).await?;
        if read == 0 {
            return Err(TransportError::Disconnected);
        }
        if read == self.max_line_len && !line.ends_with('\n') {
            return Err(TransportError::LineTooLong {
                limit: self.max_line_len,
            });
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(line)
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

/// One end of an in-memory line pipe.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create two connected in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl KvTransport for MemoryTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.tx
            .send(line.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv_line(&mut self) -> Result<String, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Disconnected)
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Source of incoming connections for the server.
#[async_trait]
pub trait Acceptor: Send {
    type Transport: KvTransport + 'static;

    /// Wait for the next connection and a label for its peer.
    async fn accept(&mut self) -> std::io::Result<(Self::Transport, String)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Transport = TcpLineTransport;

    async fn accept(&mut self) -> std::io::Result<(TcpLineTransport, String)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        Ok((LineTransport::tcp(stream), peer.to_string()))
    }
}

// ============================================================================
// Key/value channel
// ============================================================================

/// Sends and receives whole `{{key;value}}` values, slicing long values.
/// Every receive is bounded in time and in size.
pub struct KvChannel<T> {
    transport: T,
    slice_size: usize,
    timeout: Duration,
    assembler: ValueAssembler,
}

impl<T: KvTransport> KvChannel<T> {
    pub fn new(transport: T, slice_size: usize, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            transport,
            slice_size,
            timeout,
            assembler: ValueAssembler::new(slice_size)?,
        })
    }

    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reject received values longer than `max_value_len` characters.
    pub fn with_max_value_len(mut self, max_value_len: usize) -> Result<Self, TransportError> {
        self.assembler = ValueAssembler::with_max_value_len(self.slice_size, max_value_len)?;
        Ok(self)
    }

    pub fn max_value_len(&self) -> usize {
        self.assembler.max_value_len()
    }

    /// Send `value` under `key`, split into slices.
    pub async fn send(&mut self, key: &str, value: &str) -> Result<(), TransportError> {
        for slice in kv::slice_value(value, self.slice_size)? {
            let line = kv::format_line(key, slice);
            trace!(%line, "kv send");
            self.transport.send_line(&line).await?;
        }
        Ok(())
    }

    /// Receive the next complete value. The timeout covers all of its slices.
    pub async fn recv(&mut self) -> Result<KvLine, TransportError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.recv_value())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn recv_value(&mut self) -> Result<KvLine, TransportError> {
        loop {
            let line = self.transport.recv_line().await?;
            trace!(%line, "kv recv");
            if let Some(value) = self.assembler.push(kv::parse_line(&line)?)? {
                return Ok(value);
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
