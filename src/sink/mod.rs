//! Record Sinks
//!
//! A [`Sink`] receives the record sets decoded from each forward message.
//! Durable storage and re-forwarding live outside this crate; the input only
//! depends on the trait.
//!
//! Two sinks ship with the crate:
//!
//! - [`ChannelSink`]: hands each batch to a tokio channel, for embedding
//! - [`JsonLinesSink`]: writes one JSON object per record, used by the binary
//!
//! ## Semantics
//!
//! `emit` is awaited by the connection that decoded the batch. A slow sink
//! stalls that connection only. A failed `emit` terminates the connection and
//! the batch is not retried here.

use crate::protocol::{Fields, RecordSet};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

/// Errors a sink can report back to the connection handler.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer side has gone away
    #[error("sink closed")]
    Closed,

    /// I/O error while writing records out
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink refused the batch
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Downstream consumer of decoded record sets.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Accepts the record sets decoded from one wire message.
    async fn emit(&self, record_sets: Vec<RecordSet>) -> Result<(), SinkError>;
}

/// Forwards each decoded batch into a bounded tokio channel.
///
/// A full channel makes `emit` wait, which stalls the emitting connection.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<RecordSet>>,
}

impl ChannelSink {
    /// Creates a sink and the receiver its batches arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<RecordSet>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::Sender<Vec<RecordSet>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn emit(&self, record_sets: Vec<RecordSet>) -> Result<(), SinkError> {
        self.tx.send(record_sets).await.map_err(|_| SinkError::Closed)
    }
}

/// One output line of [`JsonLinesSink`].
#[derive(Serialize)]
struct JsonLine<'a> {
    tag: &'a str,
    time: u64,
    record: &'a Fields,
}

/// Writes every record as a single line of JSON:
///
/// ```text
/// {"tag":"app.log","time":1700000000,"record":{"msg":"hi"}}
/// ```
///
/// A batch is serialized up front and written with one `write_all`, so lines
/// from concurrent connections never interleave.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consumes the sink and returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<tokio::io::Stdout> {
    /// A sink writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> Sink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn emit(&self, record_sets: Vec<RecordSet>) -> Result<(), SinkError> {
        let mut buf = Vec::new();
        for set in &record_sets {
            for record in set.records() {
                serde_json::to_writer(
                    &mut buf,
                    &JsonLine {
                        tag: set.tag(),
                        time: record.timestamp(),
                        record: record.fields(),
                    },
                )?;
                buf.push(b'\n');
            }
        }

        if buf.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}
