//! Connection Handler Module
//!
//! This module manages individual forward client connections.
//! Each client connection is handled by its own async task, allowing
//! the input to serve thousands of concurrent clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Dispatcher (server::input)                 │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ register + start
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ClientRegistry                           │
//! │          id → ClientHandle (cancellation token)             │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ one task per client
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ClientHandler                              │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read bytes  │───>│ Decode msg  │───>│ Sink::emit  │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Uses Tokio for non-blocking network operations
//! - **Buffer Management**: Efficient BytesMut buffer for incoming data
//! - **Mixed Codecs**: MessagePack and JSON messages on one connection
//! - **Guaranteed Cleanup**: Deregistration runs on every exit path
//! - **Statistics**: Tracks connection and entry counters

pub mod handler;
pub mod registry;

// Re-export commonly used types
pub use handler::{
    is_temporary, ClientError, ClientHandler, Connection, ForwardStream, HandlerContext,
    InputStats,
};
pub use registry::{ClientHandle, ClientRegistry, ConnectionId, Registration};
