//! # FlashFwd - A Fluentd Forward Protocol Listener
//!
//! FlashFwd accepts log events from Fluentd / Fluent Bit style clients over
//! TCP or Unix-domain sockets, decodes them from MessagePack or JSON, and
//! hands normalized record sets to a pluggable sink.
//!
//! ## Features
//!
//! - **Forward-Compatible**: Single event, inline and packed message shapes
//! - **Mixed Codecs**: MessagePack and JSON, sniffed per message
//! - **Graceful Shutdown**: `stop()` closes the listener and every client, and
//!   `wait_for_shutdown()` resolves once all tasks have exited
//! - **Async I/O**: Built on Tokio for handling thousands of concurrent connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlashFwd                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Listener   │───>│  Acceptor   │───>│ Dispatcher  │                  │
//! │  │ (tcp/unix)  │    │    task     │    │    task     │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Forward    │    │              ClientRegistry                  │   │
//! │  │  Decoder    │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  │ (msgpack/   │<───│  │Client 1│ │Client 2│ │Client 3│ │...N    │ │   │
//! │  │   json)     │    │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │  └──────┬──────┘    └──────────────────────────────────────────────┘   │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Sink (Vec<RecordSet>)                        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashfwd::server::ForwardInput;
//! use flashfwd::sink::ChannelSink;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (sink, mut rx) = ChannelSink::new(1024);
//!     let input = ForwardInput::new("tcp://127.0.0.1:24224", Arc::new(sink)).await?;
//!     input.start();
//!
//!     while let Some(record_sets) = rx.recv().await {
//!         for set in record_sets {
//!             println!("{}: {} records", set.tag(), set.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Message Shapes
//!
//! - `[tag, time, record]`: one event
//! - `[tag, [[time, record], ...]]`: inline entries
//! - `[tag, <bytes>]`: packed entries, a concatenated stream of
//!   `[time, record]` values
//!
//! A trailing option element is accepted and ignored.
//!
//! ## Module Overview
//!
//! - [`protocol`]: Value model, record sets and the forward message decoder
//! - [`sink`]: The `Sink` trait and the stock channel / JSON-lines sinks
//! - [`connection`]: Per-client handler task and the client registry
//! - [`server`]: Address parsing, listeners and the `ForwardInput` lifecycle
//!
//! ## Design Highlights
//!
//! ### Incremental Decoding
//!
//! Forward messages carry no length prefix. The decoder reports either a
//! complete message with the bytes it consumed, or "need more data", so the
//! handler only ever retries once the socket has produced more bytes.
//!
//! ### Normalized Records
//!
//! Byte strings inside records are converted to text at decode time, so sinks
//! never see raw binary values.

pub mod connection;
pub mod protocol;
pub mod server;
pub mod sink;

// Re-export commonly used types for convenience
pub use connection::{ClientRegistry, InputStats};
pub use protocol::{decode_message, DecodeError, Record, RecordSet, Value};
pub use server::{ForwardInput, InputConfig, InputError};
pub use sink::{ChannelSink, JsonLinesSink, Sink, SinkError};

/// The default port of the forward protocol
pub const DEFAULT_PORT: u16 = 24224;

/// The default bind address
pub const DEFAULT_BIND: &str = "tcp://127.0.0.1:24224";

/// Version of FlashFwd
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
