//! Client Connection Handler
//!
//! This module handles individual forward client connections. Each client
//! gets its own handler task that runs in a loop, decoding messages and
//! handing them to the sink.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Dispatcher registers the client
//!        │
//!        ▼
//! 2. ClientHandler task spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Read bytes from socket  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Decode forward message  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Emit record sets        │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Peer closed / error / shutdown
//!        │
//!        ▼
//! 5. Socket closed, client deregistered, task ends
//! ```
//!
//! ## Buffer Management
//!
//! We use a BytesMut buffer to accumulate incoming data. Forward messages
//! carry no length prefix, so a message may arrive over many reads and one
//! read may hold several messages. A [`FrameScanner`] follows the buffer as it
//! grows and the message is decoded only once the scanner has seen its last
//! byte. Decoded bytes are split off the front; the rest waits for the next
//! message.
//!
//! When a MessagePack header declares a payload, the buffer is grown to the
//! full message size in one step, and a declared size above the limit closes
//! the connection before the payload is read.

use crate::connection::registry::{ClientHandle, ClientRegistry, ConnectionId, Registration};
use crate::protocol::{decode_message, DecodeError, Frame, FrameScanner, RecordSet};
use crate::sink::{Sink, SinkError};
use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 8192;

/// Free space guaranteed before each read
const MIN_READ_SPACE: usize = 1024;

/// Byte stream of an accepted connection.
pub trait ForwardStream: AsyncRead + Send + Unpin {}

impl<T: AsyncRead + Send + Unpin> ForwardStream for T {}

/// An accepted connection waiting to be handled.
pub struct Connection {
    stream: Box<dyn ForwardStream>,
    peer: String,
}

impl Connection {
    pub fn new(stream: impl ForwardStream + 'static, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Counters shared by every connection of one input.
#[derive(Debug, Default)]
pub struct InputStats {
    /// Total number of connections accepted
    connections_accepted: AtomicU64,
    /// Total record sets decoded (one per forward message)
    entries: AtomicU64,
    /// Total records across all record sets
    records: AtomicU64,
    /// Total bytes read
    bytes_read: AtomicU64,
}

impl InputStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sets_decoded(&self, record_sets: &[RecordSet]) {
        self.entries
            .fetch_add(record_sets.len() as u64, Ordering::Relaxed);
        let records: usize = record_sets.iter().map(RecordSet::len).sum();
        self.records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Current value of the entries counter.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

/// Per-input state every handler needs.
#[derive(Clone)]
pub struct HandlerContext {
    /// Where decoded record sets go
    pub sink: Arc<dyn Sink>,
    /// Shared counters
    pub stats: Arc<InputStats>,
    /// Largest undecoded message a client may buffer
    pub max_message_size: usize,
}

/// Handles a single forward client connection.
///
/// Field order matters: the stream is dropped (closing the socket) before the
/// registration guard removes the client from the registry.
pub struct ClientHandler {
    /// The byte stream for this connection
    stream: Box<dyn ForwardStream>,

    /// Client's address (for logging)
    peer: String,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Tracks where the buffered message ends
    frame: FrameScanner,

    /// Full decode attempts on this connection
    decodes: u64,

    /// Cancelled by [`ClientHandle::shutdown`]
    cancel: CancellationToken,

    ctx: HandlerContext,

    registration: Registration,
}

impl ClientHandler {
    /// Creates a handler and registers it.
    ///
    /// The client is visible in the registry from this point on, before its
    /// loop makes the first read.
    pub fn new(connection: Connection, registry: &Arc<ClientRegistry>, ctx: HandlerContext) -> Self {
        let cancel = CancellationToken::new();
        let handle = ClientHandle::new(registry.next_id(), connection.peer(), cancel.clone());
        let registration = registry.register(handle);

        ctx.stats.connection_opened();

        Self {
            stream: connection.stream,
            peer: connection.peer,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            frame: FrameScanner::new(),
            decodes: 0,
            cancel,
            ctx,
            registration,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.registration.id()
    }

    /// Spawns the decode loop on the input's task tracker.
    pub fn start(self, tracker: &TaskTracker) -> JoinHandle<()> {
        tracker.spawn(async move {
            let id = self.id();
            let peer = self.peer.clone();
            if let Err(e) = self.run().await {
                trace!(client = %peer, id = id, error = %e, "Handler exited");
            }
        })
    }

    /// Runs the decode loop until the peer closes, an error occurs or the
    /// client is shut down. The socket is closed and the client deregistered
    /// when this returns.
    pub async fn run(mut self) -> Result<(), ClientError> {
        info!(client = %self.peer, id = self.id(), "Started handling connection");

        let result = self.main_loop().await;

        match &result {
            Ok(()) | Err(ClientError::ClientDisconnected) => {
                info!(client = %self.peer, "Client closed the connection")
            }
            Err(ClientError::Shutdown) => {
                debug!(client = %self.peer, "Connection closed by shutdown")
            }
            Err(ClientError::Io(io_err)) if io_err.kind() == io::ErrorKind::ConnectionReset => {
                debug!(client = %self.peer, "Connection reset by client")
            }
            Err(e) => error!(client = %self.peer, error = %e, "Connection error"),
        }

        info!(client = %self.peer, decodes = self.decodes, "Ended handling connection");
        result
    }

    /// The main read-decode-emit loop.
    async fn main_loop(&mut self) -> Result<(), ClientError> {
        loop {
            match self.next_record_sets().await {
                Ok(record_sets) => {
                    if !record_sets.is_empty() {
                        self.ctx.sink.emit(record_sets).await?;
                    }
                }
                Err(ClientError::Io(e)) if is_temporary(&e) => {
                    info!(client = %self.peer, error = %e, "Temporary failure");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads until one full message is buffered, then decodes it.
    async fn next_record_sets(&mut self) -> Result<Vec<RecordSet>, ClientError> {
        loop {
            let needed = match self.frame.scan(&self.buffer) {
                Frame::Incomplete { needed } => needed,
                Frame::Complete(_) | Frame::Invalid => match self.decode_buffered()? {
                    Some(record_sets) => return Ok(record_sets),
                    None => self.buffer.len() + 1,
                },
            };

            if needed > self.ctx.max_message_size {
                error!(
                    client = %self.peer,
                    needed = needed,
                    "Message exceeds size limit"
                );
                return Err(ClientError::BufferFull(self.ctx.max_message_size));
            }

            match self.read_more_data(needed).await {
                Err(ClientError::UnexpectedEof) => {
                    // The partial message may already be malformed
                    if let Some(record_sets) = self.decode_buffered()? {
                        return Ok(record_sets);
                    }
                    return Err(ClientError::UnexpectedEof);
                }
                other => other?,
            }
        }
    }

    /// Decodes the message at the front of the buffer.
    fn decode_buffered(&mut self) -> Result<Option<Vec<RecordSet>>, ClientError> {
        self.decodes += 1;

        match decode_message(&self.buffer)? {
            Some((record_sets, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                self.frame.reset();
                self.ctx.stats.record_sets_decoded(&record_sets);
                trace!(
                    client = %self.peer,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Decoded message"
                );
                Ok(Some(record_sets))
            }
            None => {
                trace!(
                    client = %self.peer,
                    buffered = self.buffer.len(),
                    "Incomplete message, need more data"
                );
                Ok(None)
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    ///
    /// `needed` is the buffered length the current message requires.
    async fn read_more_data(&mut self, needed: usize) -> Result<(), ClientError> {
        // Check buffer size limit
        if self.buffer.len() >= self.ctx.max_message_size {
            error!(
                client = %self.peer,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ClientError::BufferFull(self.ctx.max_message_size));
        }

        if needed > self.buffer.capacity() && needed - self.buffer.len() > MIN_READ_SPACE {
            // Declared size is known: one allocation for the whole message
            self.buffer.reserve(needed - self.buffer.len());
        } else if self.buffer.capacity() - self.buffer.len() < MIN_READ_SPACE {
            self.buffer
                .reserve(self.buffer.len().max(INITIAL_BUFFER_SIZE));
        }

        let n = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ClientError::Shutdown),
            read = self.stream.read_buf(&mut self.buffer) => read?,
        };

        if n == 0 {
            // Connection closed by client
            if self.buffer.is_empty() {
                return Err(ClientError::ClientDisconnected);
            } else {
                // Partial message in buffer
                return Err(ClientError::UnexpectedEof);
            }
        }

        self.ctx.stats.add_bytes_read(n);
        trace!(client = %self.peer, bytes = n, "Read data");

        Ok(())
    }
}

/// Whether an I/O error leaves the connection usable for the next read.
pub fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Errors that end (or, for temporary I/O errors, interrupt) a client's loop.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed forward message
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Client disconnected normally
    #[error("client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial message)
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A single message grew past the configured limit
    #[error("message exceeds {0} bytes")]
    BufferFull(usize),

    /// The sink rejected a batch
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The input is shutting down
    #[error("connection closed by shutdown")]
    Shutdown,
}
