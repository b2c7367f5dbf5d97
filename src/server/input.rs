//! Forward Input
//!
//! [`ForwardInput`] owns the listening socket and every client connection
//! accepted on it.
//!
//! ## Tasks
//!
//! ```text
//!                  ┌──────────────┐   mpsc    ┌──────────────┐
//!   listener ────► │   Acceptor   │ ────────► │  Dispatcher  │ ◄──── stop()
//!                  └──────────────┘           └──────┬───────┘   (oneshot)
//!                                                    │
//!                                   register + spawn │
//!                                                    ▼
//!                                  ┌─────────────────────────────────┐
//!                                  │ ClientHandler  ClientHandler ...│
//!                                  └─────────────────────────────────┘
//! ```
//!
//! Every task is spawned on one [`TaskTracker`], which is the completion
//! barrier behind [`ForwardInput::wait_for_shutdown`].
//!
//! ## States
//!
//! `Created → Running → Stopping → Stopped`
//!
//! - `start()` spawns the acceptor and dispatcher and returns immediately.
//! - `stop()` flips the shutdown flag with a compare-and-swap; only the
//!   winner sends the one-shot signal, so repeated or concurrent calls are
//!   no-ops.
//! - On the signal the dispatcher closes the listener and shuts down every
//!   registered client, then exits.
//! - The input is stopped once the acceptor, the dispatcher and every client
//!   handler have finished.

use crate::connection::{ClientHandler, ClientRegistry, Connection, HandlerContext, InputStats};
use crate::server::address::parse_address;
use crate::server::listener::Listener;
use crate::server::InputError;
use crate::sink::Sink;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Default cap on a single buffered, not yet decoded message (64 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default capacity of the acceptor → dispatcher queue
pub const DEFAULT_ACCEPT_QUEUE: usize = 16;

/// Configuration for a forward input.
#[derive(Debug, Clone)]
pub struct InputConfig {
    /// Bind address, `tcp://<host:port>` or `unix://<path>`
    pub bind: String,

    /// Largest message a client may send; larger ones close the connection
    pub max_message_size: usize,

    /// Accepted connections waiting for the dispatcher
    pub accept_queue: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            bind: crate::DEFAULT_BIND.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            accept_queue: DEFAULT_ACCEPT_QUEUE,
        }
    }
}

impl InputConfig {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            ..Default::default()
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_accept_queue(mut self, accept_queue: usize) -> Self {
        self.accept_queue = accept_queue.max(1);
        self
    }
}

/// Resources that `start()` hands over to the acceptor and dispatcher.
struct Pending {
    listener: Listener,
    shutdown_rx: oneshot::Receiver<()>,
}

/// A Fluentd Forward listener.
///
/// # Example
///
/// ```ignore
/// use flashfwd::server::ForwardInput;
/// use flashfwd::sink::JsonLinesSink;
/// use std::sync::Arc;
///
/// let input = ForwardInput::new("tcp://127.0.0.1:24224", Arc::new(JsonLinesSink::stdout())).await?;
/// input.start();
///
/// tokio::signal::ctrl_c().await?;
///
/// input.stop();
/// input.wait_for_shutdown().await;
/// ```
pub struct ForwardInput {
    config: InputConfig,
    local_addr: String,
    sink: Arc<dyn Sink>,
    registry: Arc<ClientRegistry>,
    stats: Arc<InputStats>,
    shutting_down: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    pending: Mutex<Option<Pending>>,
    tracker: TaskTracker,
}

impl ForwardInput {
    /// Parses `bind` and opens the listening socket with default settings.
    pub async fn new(bind: &str, sink: Arc<dyn Sink>) -> Result<Self, InputError> {
        Self::with_config(InputConfig::new(bind), sink).await
    }

    /// Parses the bind address and opens the listening socket.
    ///
    /// # Errors
    ///
    /// - [`InputError::InvalidAddress`] if the bind address is malformed
    /// - [`InputError::ListenFailure`] if the socket cannot be bound
    pub async fn with_config(config: InputConfig, sink: Arc<dyn Sink>) -> Result<Self, InputError> {
        let address = parse_address(&config.bind).map_err(|e| {
            error!(error = %e, "Invalid listen address");
            e
        })?;

        let listen_failure = |source| {
            let e = InputError::ListenFailure {
                bind: config.bind.clone(),
                source,
            };
            error!(error = %e, "Failed to listen");
            e
        };

        let listener = Listener::bind(&address).await.map_err(listen_failure)?;
        let local_addr = listener.local_addr().map_err(listen_failure)?;
        info!(bind = %address, local = %local_addr, "Listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Ok(Self {
            config,
            local_addr,
            sink,
            registry: Arc::new(ClientRegistry::new()),
            stats: Arc::new(InputStats::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            pending: Mutex::new(Some(Pending {
                listener,
                shutdown_rx,
            })),
            tracker: TaskTracker::new(),
        })
    }

    /// Spawns the acceptor and dispatcher tasks and returns immediately.
    ///
    /// Must be called from within a Tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(pending) = lock(&self.pending).take() else {
            warn!(bind = %self.config.bind, "Input already started");
            return;
        };

        let (accept_tx, accept_rx) = mpsc::channel(self.config.accept_queue);
        let close_listener = CancellationToken::new();

        info!("Spawning acceptor");
        self.tracker.spawn(acceptor_loop(
            pending.listener,
            accept_tx,
            close_listener.clone(),
        ));

        info!("Spawning dispatcher");
        self.tracker.spawn(dispatcher_loop(Dispatcher {
            accept_rx,
            shutdown_rx: pending.shutdown_rx,
            close_listener,
            registry: Arc::clone(&self.registry),
            ctx: HandlerContext {
                sink: Arc::clone(&self.sink),
                stats: Arc::clone(&self.stats),
                max_message_size: self.config.max_message_size,
            },
            tracker: self.tracker.clone(),
        }));

        // Handlers spawned later by the dispatcher are still waited on
        self.tracker.close();
    }

    /// Requests shutdown. Idempotent and safe to call concurrently.
    ///
    /// Returns `true` for the one call that sent the shutdown signal.
    pub fn stop(&self) -> bool {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        info!(bind = %self.config.bind, "Shutdown requested");
        match lock(&self.shutdown_tx).take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Resolves once the acceptor, the dispatcher and every client handler
    /// have exited. Resolves immediately if the input was never started.
    pub async fn wait_for_shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!(bind = %self.config.bind, "Input stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Total record sets decoded across all connections.
    pub fn entries(&self) -> u64 {
        self.stats.entries()
    }

    /// Number of currently registered client connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> &InputStats {
        &self.stats
    }

    /// The bind address this input was created with.
    pub fn bind(&self) -> &str {
        &self.config.bind
    }

    /// Actual bound address (`ip:port` or socket path).
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

impl fmt::Display for ForwardInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "forward input ({})", self.config.bind)
    }
}

/// Accepts connections until the listener fails or is closed.
///
/// Exiting drops both the listener and the queue sender, which tells the
/// dispatcher no more connections will arrive.
async fn acceptor_loop(
    listener: Listener,
    accept_tx: mpsc::Sender<Connection>,
    close: CancellationToken,
) {
    info!("Acceptor started");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = close.cancelled() => {
                info!("Listener closed");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                info!(client = %conn.peer(), "Connected");
                tokio::select! {
                    biased;
                    _ = close.cancelled() => break,
                    sent = accept_tx.send(conn) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                break;
            }
        }
    }

    drop(listener);
    info!("Acceptor ended");
}

struct Dispatcher {
    accept_rx: mpsc::Receiver<Connection>,
    shutdown_rx: oneshot::Receiver<()>,
    close_listener: CancellationToken,
    registry: Arc<ClientRegistry>,
    ctx: HandlerContext,
    tracker: TaskTracker,
}

/// Starts a handler per accepted connection; on shutdown closes the listener
/// and every live client.
///
/// Registration and the shutdown sweep both run on this task, so the sweep
/// never sees a half-constructed handler.
async fn dispatcher_loop(mut d: Dispatcher) {
    info!("Dispatcher started");
    let mut accepting = true;

    loop {
        tokio::select! {
            biased;
            // A dropped sender (input dropped without stop) also ends the loop
            _ = &mut d.shutdown_rx => break,
            conn = d.accept_rx.recv(), if accepting => match conn {
                Some(conn) => {
                    debug!(client = %conn.peer(), "Got connection from acceptor");
                    ClientHandler::new(conn, &d.registry, d.ctx.clone()).start(&d.tracker);
                }
                None => {
                    debug!("Accept queue closed");
                    accepting = false;
                }
            },
        }
    }

    d.close_listener.cancel();
    let clients = d.registry.shutdown_all();
    info!(clients = clients, "Dispatcher ended");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Fields, RecordSet, Value};
    use crate::sink::ChannelSink;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    async fn start_input() -> (Arc<ForwardInput>, mpsc::Receiver<Vec<RecordSet>>) {
        let (sink, rx) = ChannelSink::new(64);
        let input = ForwardInput::new("tcp://127.0.0.1:0", Arc::new(sink))
            .await
            .unwrap();
        input.start();
        (Arc::new(input), rx)
    }

    async fn stop_and_wait(input: &ForwardInput) {
        input.stop();
        timeout(Duration::from_secs(5), input.wait_for_shutdown())
            .await
            .expect("input did not shut down");
    }

    async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn single(tag: &str, ts: u64, msg: &str) -> Vec<u8> {
        let mut fields = Fields::new();
        fields.insert("msg".to_string(), Value::from(msg));
        rmp_serde::to_vec(&Value::Array(vec![
            Value::from(tag),
            Value::UInt(ts),
            Value::Map(fields),
        ]))
        .unwrap()
    }

    async fn recv(rx: &mut mpsc::Receiver<Vec<RecordSet>>) -> Vec<RecordSet> {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no record sets received")
            .expect("sink channel closed")
    }

    #[tokio::test]
    async fn test_forward_single_event() {
        let (input, mut rx) = start_input().await;

        let mut client = TcpStream::connect(input.local_addr()).await.unwrap();
        client
            .write_all(&single("app.log", 1700000000, "hi"))
            .await
            .unwrap();

        let batch = recv(&mut rx).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].tag(), "app.log");
        assert_eq!(batch[0].records()[0].timestamp(), 1700000000);
        assert_eq!(batch[0].records()[0].get("msg"), Some(&Value::from("hi")));
        assert_eq!(input.entries(), 1);

        stop_and_wait(&input).await;
    }

    #[tokio::test]
    async fn test_entries_count_messages_not_records() {
        let (input, mut rx) = start_input().await;
        let mut client = TcpStream::connect(input.local_addr()).await.unwrap();

        for i in 0..5 {
            client.write_all(&single("n", i, "x")).await.unwrap();
        }
        for _ in 0..5 {
            recv(&mut rx).await;
        }
        assert_eq!(input.entries(), 5);

        client
            .write_all(br#"["m", [[1, {"a": 1}], [2, {"a": 2}], [3, {"a": 3}]]]"#)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await[0].len(), 3);
        assert_eq!(input.entries(), 6);

        stop_and_wait(&input).await;
    }

    #[tokio::test]
    async fn test_mixed_codecs_on_one_connection() {
        let (input, mut rx) = start_input().await;
        let mut client = TcpStream::connect(input.local_addr()).await.unwrap();

        let mut bytes = br#"["json", 1, {"k": "v"}]"#.to_vec();
        bytes.extend_from_slice(&single("msgpack", 2, "v"));
        client.write_all(&bytes).await.unwrap();

        assert_eq!(recv(&mut rx).await[0].tag(), "json");
        assert_eq!(recv(&mut rx).await[0].tag(), "msgpack");

        stop_and_wait(&input).await;
    }

    #[tokio::test]
    async fn test_malformed_message_closes_only_that_client() {
        let (input, mut rx) = start_input().await;

        let mut good = TcpStream::connect(input.local_addr()).await.unwrap();
        good.write_all(&single("good", 1, "first")).await.unwrap();
        recv(&mut rx).await;

        let mut bad = TcpStream::connect(input.local_addr()).await.unwrap();
        eventually("both clients registered", || input.connection_count() == 2).await;

        bad.write_all(br#"["bad", "not a timestamp", {}]"#)
            .await
            .unwrap();
        eventually("bad client removed", || input.connection_count() == 1).await;

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), bad.read(&mut buf))
            .await
            .expect("socket was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        good.write_all(&single("good", 2, "second")).await.unwrap();
        assert_eq!(recv(&mut rx).await[0].records()[0].timestamp(), 2);

        stop_and_wait(&input).await;
    }

    #[tokio::test]
    async fn test_stop_closes_live_clients() {
        let (input, mut rx) = start_input().await;

        let mut clients = Vec::new();
        for i in 0..3 {
            let mut client = TcpStream::connect(input.local_addr()).await.unwrap();
            client.write_all(&single("idle", i, "x")).await.unwrap();
            recv(&mut rx).await;
            clients.push(client);
        }
        assert_eq!(input.connection_count(), 3);
        assert_eq!(input.stats().connections_accepted(), 3);
        assert_eq!(input.stats().records(), 3);

        stop_and_wait(&input).await;
        assert_eq!(input.connection_count(), 0);

        for client in &mut clients {
            let mut buf = [0u8; 16];
            let read = timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("socket was not closed");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // The listener is gone too
        assert!(TcpStream::connect(input.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let (input, _rx) = start_input().await;

        assert!(input.stop());
        assert!(!input.stop());
        assert!(input.is_shutting_down());

        timeout(Duration::from_secs(5), input.wait_for_shutdown())
            .await
            .expect("input did not shut down");
        // Waiting again returns straight away
        timeout(Duration::from_secs(1), input.wait_for_shutdown())
            .await
            .expect("second wait blocked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stop() {
        let (input, _rx) = start_input().await;

        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let input = Arc::clone(&input);
                tokio::spawn(async move { input.stop() })
            })
            .collect();
        let mut signalled = 0;
        for stopper in stoppers {
            if stopper.await.unwrap() {
                signalled += 1;
            }
        }
        assert_eq!(signalled, 1);
        assert!(input.is_shutting_down());
        assert!(lock(&input.shutdown_tx).is_none());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let input = Arc::clone(&input);
                tokio::spawn(async move { input.wait_for_shutdown().await })
            })
            .collect();
        for waiter in waiters {
            timeout(Duration::from_secs(5), waiter)
                .await
                .expect("input did not shut down")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_before_start_returns() {
        let (sink, _rx) = ChannelSink::new(1);
        let input = ForwardInput::new("tcp://127.0.0.1:0", Arc::new(sink))
            .await
            .unwrap();

        timeout(Duration::from_secs(1), input.wait_for_shutdown())
            .await
            .expect("wait blocked without start");
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (sink, _rx) = ChannelSink::new(1);
        let input = ForwardInput::new("tcp://127.0.0.1:0", Arc::new(sink))
            .await
            .unwrap();

        input.stop();
        input.start();
        timeout(Duration::from_secs(5), input.wait_for_shutdown())
            .await
            .expect("input did not shut down");
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let (input, mut rx) = start_input().await;
        input.start();

        let mut client = TcpStream::connect(input.local_addr()).await.unwrap();
        client.write_all(&single("once", 1, "x")).await.unwrap();
        assert_eq!(recv(&mut rx).await[0].tag(), "once");

        stop_and_wait(&input).await;
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let (sink, _rx) = ChannelSink::new(1);
        let result = ForwardInput::new("http://x", Arc::new(sink)).await;
        assert!(matches!(result, Err(InputError::InvalidAddress(ref s)) if s == "http://x"));
    }

    #[tokio::test]
    async fn test_listen_failure() {
        let (input, _rx) = start_input().await;
        let taken = format!("tcp://{}", input.local_addr());

        let (sink, _rx2) = ChannelSink::new(1);
        let result = ForwardInput::new(&taken, Arc::new(sink)).await;
        assert!(matches!(result, Err(InputError::ListenFailure { .. })));

        stop_and_wait(&input).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwd.sock");
        let (sink, mut rx) = ChannelSink::new(8);
        let input = ForwardInput::new(&format!("unix://{}", path.display()), Arc::new(sink))
            .await
            .unwrap();
        input.start();

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        client
            .write_all(b"[\"unix.log\", 1700000000, {\"msg\": \"over unix\"}]\n")
            .await
            .unwrap();

        let batch = recv(&mut rx).await;
        assert_eq!(batch[0].tag(), "unix.log");

        stop_and_wait(&input).await;
        assert!(!path.exists());
    }
}
