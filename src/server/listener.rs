//! Listening Sockets
//!
//! Wraps the TCP and Unix-domain listeners behind one accept call that
//! yields transport-agnostic [`Connection`]s.

use crate::connection::Connection;
use crate::server::address::{ListenAddress, Transport};
use std::io;
use tokio::net::TcpListener;
use tracing::debug;

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::UnixListener;

/// An open listening socket.
///
/// Dropping a Unix listener also removes its socket file.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// Binds a socket for the given address.
    pub(crate) async fn bind(address: &ListenAddress) -> io::Result<Self> {
        match address.transport() {
            Transport::Tcp => Ok(Listener::Tcp(TcpListener::bind(address.endpoint()).await?)),
            #[cfg(unix)]
            Transport::Unix => {
                let path = PathBuf::from(address.endpoint());
                let listener = UnixListener::bind(&path)?;
                Ok(Listener::Unix { listener, path })
            }
            #[cfg(not(unix))]
            Transport::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }

    /// Bound address: `ip:port` for TCP (with the real port when bound to 0),
    /// the socket path for Unix sockets.
    pub(crate) fn local_addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(path.display().to_string()),
        }
    }

    /// Waits for the next client.
    pub(crate) async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok(Connection::new(stream, addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                // Unix peers are almost always unnamed
                let (stream, _) = listener.accept().await?;
                Ok(Connection::new(stream, format!("unix:{}", path.display())))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix { path, .. } => {
                if let Err(e) = std::fs::remove_file(&*path) {
                    debug!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
    }
}
