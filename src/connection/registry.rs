//! Live Client Registry
//!
//! Tracks every connection whose handler is running (or about to start), so
//! shutdown can reach all of them.
//!
//! ## Lifecycle
//!
//! ```text
//! dispatcher                          handler task
//! ──────────                          ────────────
//! register(handle) ──► Registration ──► moved into ClientHandler
//!                                          │
//! shutdown_all() ──► handle.shutdown()     │ (read aborts)
//!                                          ▼
//!                                      Registration dropped ──► deregister(id)
//! ```
//!
//! Deregistration lives in `Drop`, so it runs exactly once on every exit path
//! of the handler: clean close, decode error, sink failure or shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Identity of one accepted connection within an input.
pub type ConnectionId = u64;

/// The registry's view of a running client handler.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    peer: String,
    cancel: CancellationToken,
}

impl ClientHandle {
    pub fn new(id: ConnectionId, peer: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer: peer.into(),
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Forcibly closes the connection: the handler's pending read is aborted
    /// and its loop exits through the normal error path.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Mutex-guarded map of live client handlers.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ConnectionId, ClientHandle>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh connection id.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a handle. It stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, handle: ClientHandle) -> Registration {
        let id = handle.id;
        self.lock().insert(id, handle);
        trace!(id = id, "Client registered");

        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Shuts down every registered client. Returns how many were signalled.
    ///
    /// Handles are snapshotted first so handlers deregistering concurrently
    /// never wait on a lock held across the sweep.
    pub fn shutdown_all(&self) -> usize {
        let handles: Vec<ClientHandle> = self.lock().values().cloned().collect();
        for handle in &handles {
            trace!(id = handle.id, client = %handle.peer, "Shutting down client");
            handle.shutdown();
        }
        handles.len()
    }

    fn deregister(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ClientHandle>> {
        // A panicking handler must not take the whole input down with it
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard tying a handler's lifetime to its registry entry.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ClientRegistry>,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.deregister(self.id) {
            trace!(id = self.id, "Client deregistered");
        }
    }
}
