//! Listen Address Parsing
//!
//! A bind address names a transport and an endpoint:
//!
//! ```text
//! tcp://127.0.0.1:24224
//! unix:///var/run/fluent.sock
//! ```

use crate::server::InputError;
use std::fmt;
use std::str::FromStr;

/// Socket transport of a listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

impl Transport {
    /// URL scheme of this transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
        }
    }
}

/// A parsed bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    transport: Transport,
    endpoint: String,
}

impl ListenAddress {
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// `host:port` for TCP, a filesystem path for Unix sockets.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport.scheme(), self.endpoint)
    }
}

impl FromStr for ListenAddress {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s)
    }
}

/// Parses `tcp://<host:port>` or `unix://<path>`.
///
/// The endpoint must be non-empty and fit on one line.
pub fn parse_address(bind: &str) -> Result<ListenAddress, InputError> {
    let (transport, endpoint) = if let Some(rest) = bind.strip_prefix("tcp://") {
        (Transport::Tcp, rest)
    } else if let Some(rest) = bind.strip_prefix("unix://") {
        (Transport::Unix, rest)
    } else {
        return Err(InputError::InvalidAddress(bind.to_string()));
    };

    if endpoint.is_empty() || endpoint.contains('\n') {
        return Err(InputError::InvalidAddress(bind.to_string()));
    }

    Ok(ListenAddress {
        transport,
        endpoint: endpoint.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr = parse_address("tcp://127.0.0.1:24224").unwrap();
        assert_eq!(addr.transport(), Transport::Tcp);
        assert_eq!(addr.endpoint(), "127.0.0.1:24224");
    }

    #[test]
    fn test_parse_unix() {
        let addr = parse_address("unix:///tmp/fwd.sock").unwrap();
        assert_eq!(addr.transport(), Transport::Unix);
        assert_eq!(addr.endpoint(), "/tmp/fwd.sock");
    }

    #[test]
    fn test_parse_rejects_other_forms() {
        for bind in [
            "http://x",
            "udp://127.0.0.1:24224",
            "127.0.0.1:24224",
            "TCP://127.0.0.1:24224",
            "tcp://",
            "unix://",
            "tcp:/127.0.0.1:1",
            "tcp://host:1\nunix://x",
            "",
        ] {
            assert!(
                matches!(parse_address(bind), Err(InputError::InvalidAddress(ref s)) if s == bind),
                "{:?} should be rejected",
                bind
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        for bind in ["tcp://[::1]:24224", "unix://relative.sock"] {
            let addr: ListenAddress = bind.parse().unwrap();
            assert_eq!(addr.to_string(), bind);
        }
    }
}
