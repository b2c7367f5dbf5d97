//! Server Module
//!
//! This module owns the listening side of the input: parsing the bind
//! address, opening the TCP or Unix-domain socket, and supervising the
//! acceptor, the dispatcher and every client handler.
//!
//! ## Components
//!
//! - [`address`]: `tcp://` / `unix://` bind addresses
//! - [`input`]: [`ForwardInput`], the start/stop lifecycle and counters
//! - `listener`: the socket wrapper handing out connections

pub mod address;
pub mod input;
pub(crate) mod listener;

use std::io;

pub use address::{parse_address, ListenAddress, Transport};
pub use input::{ForwardInput, InputConfig, DEFAULT_ACCEPT_QUEUE, DEFAULT_MAX_MESSAGE_SIZE};

/// Errors raised while constructing an input.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// The bind string is not `tcp://<host:port>` or `unix://<path>`
    #[error("invalid listen address: {0:?}")]
    InvalidAddress(String),

    /// The socket could not be bound
    #[error("failed to listen on {bind}: {source}")]
    ListenFailure {
        bind: String,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InputError::InvalidAddress("http://x".to_string());
        assert_eq!(err.to_string(), "invalid listen address: \"http://x\"");

        let err = InputError::ListenFailure {
            bind: "tcp://127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("failed to listen on tcp://127.0.0.1:1"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
