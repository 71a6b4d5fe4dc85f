//! The duplex RPC endpoint: connection ownership, read/write loops,
//! correlation table, and inbound dispatch.
//!
//! An [`Endpoint`] owns at most one connection at a time. Outbound traffic
//! goes through a bounded queue drained by a writer task; inbound bytes are
//! decoded by a reader task and dispatched inline. A connection failure in
//! either task tears the connection down exactly once and hands the failure
//! to the configured [`ReconnectPolicy`], which may attach a replacement via
//! [`Endpoint::attach_connection`].
//!
//! Handlers run inline on the reading path, so a slow handler stalls further
//! inbound decoding on that connection. Responses carry their own id, so
//! out-of-order completion on the peer side is handled by the correlation
//! table, not by position.
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use bytes::Bytes;
use rmpv::Value;
use tokio::{
    io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
    error::{Result, RpcError},
    message::{Codec, Message, Notification, Request, Response},
    reconnect::ReconnectPolicy,
    router::Router,
};

/// Which RPC roles the endpoint plays on its connection.
///
/// The mode gates both directions: inbound messages of a kind the mode does
/// not accept are a protocol error, and outbound `call`/`notify` require the
/// client role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sends requests and notifications, accepts responses.
    Client,
    /// Accepts requests and notifications, sends responses.
    Server,
    /// Both roles over the same connection.
    Both,
}

impl Mode {
    pub fn is_client(self) -> bool {
        matches!(self, Mode::Client | Mode::Both)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Mode::Server | Mode::Both)
    }
}

/// Construction-time endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Which message kinds are accepted and produced.
    pub mode: Mode,
    /// How long a `call` waits for its response.
    pub call_timeout: Duration,
    /// Bound of the outbound queue; producers block when it is full.
    pub outbound_queue_capacity: usize,
    /// Read buffer size for the reader task.
    pub read_chunk_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Both,
            call_timeout: Duration::from_secs(5),
            outbound_queue_capacity: 10,
            read_chunk_size: 32 * 1024,
        }
    }
}

enum ConnState {
    Disconnected,
    Connected {
        generation: u64,
        shutdown: CancellationToken,
    },
}

struct Shared {
    config: EndpointConfig,
    router: Arc<Router>,
    reconnect: Arc<dyn ReconnectPolicy>,
    /// Correlation table: outstanding call id -> pending-result slot.
    pending: Mutex<HashMap<u32, oneshot::Sender<std::result::Result<Value, Value>>>>,
    next_id: AtomicU32,
    conn: StdMutex<ConnState>,
    next_generation: AtomicU64,
    outbound_tx: mpsc::Sender<Bytes>,
    /// Held by the writer task for the lifetime of a connection; the queue
    /// itself outlives connections, so unsent messages survive a swap.
    outbound_rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

/// A duplex msgpack-rpc endpoint. Cheap to clone; all clones share the same
/// connection, queue, and correlation table.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Creates an endpoint with no connection attached. Attach one with
    /// [`attach_connection`](Endpoint::attach_connection); `call` and
    /// `notify` may be used before that, queueing up to the configured
    /// capacity.
    pub fn new(
        router: Arc<Router>,
        reconnect: impl ReconnectPolicy,
        config: EndpointConfig,
    ) -> Self {
        let capacity = config.outbound_queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                router,
                reconnect: Arc::new(reconnect),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(0),
                conn: StdMutex::new(ConnState::Disconnected),
                next_generation: AtomicU64::new(1),
                outbound_tx,
                outbound_rx: Mutex::new(outbound_rx),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Installs a connected byte stream and starts its reader and writer
    /// tasks. Returns `false` if a connection is already installed or the
    /// endpoint is closed; the caller must retry later with a fresh stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach_connection<S>(&self, stream: S) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // The slot lock is held across task spawn so that an instantly
        // failing task cannot run its teardown before the slot says
        // Connected. The closed check lives under the same lock so that a
        // concurrent close() cannot slip between check and install.
        let mut slot = self.shared.conn.lock().expect("connection slot poisoned");
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }
        if matches!(*slot, ConnState::Connected { .. }) {
            return false;
        }
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let (read_half, write_half) = split(stream);
        tokio::spawn(read_loop(
            self.shared.clone(),
            read_half,
            generation,
            shutdown.clone(),
        ));
        tokio::spawn(write_loop(
            self.shared.clone(),
            write_half,
            generation,
            shutdown.clone(),
        ));
        *slot = ConnState::Connected {
            generation,
            shutdown,
        };
        trace!(generation, "connection attached");
        true
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Suspends while the outbound queue is full (backpressure) and until the
    /// response arrives or `call_timeout` elapses. A connection need not be
    /// attached; the request is queued regardless. Connection failures do not
    /// surface here; an in-flight call keeps waiting until its own timeout.
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        self.check_outbound(method)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let message = Message::Request(Request {
            id,
            method: method.to_string(),
            params: params.to_vec(),
        });
        let body = match message.encode() {
            Ok(body) => body,
            Err(e) => {
                self.shared.pending.lock().await.remove(&id);
                return Err(e);
            }
        };
        if self.shared.outbound_tx.send(body).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcError::Closed);
        }

        let timeout = self.shared.config.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(RpcError::Remote(error)),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                // Remove the entry so a late response is dropped as
                // "unexpected id" instead of resolving a dead waiter.
                self.shared.pending.lock().await.remove(&id);
                Err(RpcError::Timeout { id, timeout })
            }
        }
    }

    /// Sends a fire-and-forget notification. Returns once the message is
    /// queued; no correlation entry is created and no response is expected.
    pub async fn notify(&self, method: &str, params: &[Value]) -> Result<()> {
        self.check_outbound(method)?;
        let message = Message::Notification(Notification {
            method: method.to_string(),
            params: params.to_vec(),
        });
        let body = message.encode()?;
        self.shared
            .outbound_tx
            .send(body)
            .await
            .map_err(|_| RpcError::Closed)
    }

    /// Closes the endpoint: detaches the current connection and rejects
    /// further `attach_connection`/`call`/`notify`. Idempotent. Pending calls
    /// are not resolved; they run out their own timeout.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slot = self.shared.conn.lock().expect("connection slot poisoned");
        if let ConnState::Connected { shutdown, .. } = &*slot {
            shutdown.cancel();
        }
        *slot = ConnState::Disconnected;
        trace!("endpoint closed");
    }

    /// Whether a connection is currently installed.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self.shared.conn.lock().expect("connection slot poisoned"),
            ConnState::Connected { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of encoded messages waiting in the outbound queue. Used by
    /// demand-driven reconnect policies.
    pub fn queued_outbound(&self) -> usize {
        let tx = &self.shared.outbound_tx;
        tx.max_capacity() - tx.capacity()
    }

    fn check_outbound(&self, method: &str) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        if method.is_empty() {
            return Err(RpcError::InvalidRequest("empty method name".into()));
        }
        if !self.shared.config.mode.is_client() {
            return Err(RpcError::InvalidRequest(format!(
                "cannot send in {:?} mode",
                self.shared.config.mode
            )));
        }
        Ok(())
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

impl Shared {
    /// Detaches the connection identified by `generation` and reports the
    /// failure to the reconnect policy. Exactly one of the reader/writer
    /// tasks performs this per failure: the generation check makes the
    /// second caller a no-op, and the cancelled token stops the other task.
    fn teardown(self: &Arc<Self>, generation: u64, cause: RpcError) {
        {
            let mut slot = self.conn.lock().expect("connection slot poisoned");
            match &*slot {
                ConnState::Connected {
                    generation: current,
                    shutdown,
                } if *current == generation => {
                    shutdown.cancel();
                    *slot = ConnState::Disconnected;
                }
                _ => return,
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            trace!(generation, "connection detached on close");
            return;
        }
        warn!(generation, %cause, "connection failed, detaching");
        let policy = self.reconnect.clone();
        let endpoint = Endpoint::from_shared(self.clone());
        tokio::spawn(async move {
            policy.on_connection_error(endpoint, cause).await;
        });
    }

    async fn dispatch(self: &Arc<Self>, message: Message) -> Result<()> {
        match message {
            Message::Response(response) if self.config.mode.is_client() => {
                self.resolve(response).await;
                Ok(())
            }
            Message::Request(request) if self.config.mode.is_server() => {
                self.handle_request(request).await
            }
            Message::Notification(notification) if self.config.mode.is_server() => {
                self.handle_notification(notification).await;
                Ok(())
            }
            other => Err(RpcError::Protocol(format!(
                "{} not accepted in {:?} mode",
                other.kind(),
                self.config.mode
            ))),
        }
    }

    async fn resolve(&self, response: Response) {
        let waiter = self.pending.lock().await.remove(&response.id);
        match waiter {
            // The receiver may have timed out between removal and send; a
            // failed send here is the expected no-op, not an error.
            Some(tx) => drop(tx.send(response.result)),
            None => warn!(id = response.id, "response with no matching call"),
        }
    }

    async fn handle_request(&self, request: Request) -> Result<()> {
        let result = match self.router.call_handler(&request.method) {
            Some(handler) => handler.handle(request.params).await,
            None => {
                warn!(method = %request.method, "call method not found");
                Err(Value::from(format!(
                    "method not found: {}",
                    request.method
                )))
            }
        };
        let response = Message::Response(Response {
            id: request.id,
            result,
        });
        let body = response.encode()?;
        self.outbound_tx
            .send(body)
            .await
            .map_err(|_| RpcError::Closed)
    }

    async fn handle_notification(&self, notification: Notification) {
        match self.router.notify_handler(&notification.method) {
            Some(handler) => {
                if let Err(error) = handler.handle(notification.params).await {
                    warn!(method = %notification.method, %error, "notify handler failed");
                }
            }
            None => warn!(method = %notification.method, "notify method not found"),
        }
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut read_half: R,
    generation: u64,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut codec = Codec::with_capacity(shared.config.read_chunk_size);
    let mut chunk = vec![0u8; shared.config.read_chunk_size];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = read_half.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection");
                shared.teardown(generation, eof.into());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                shared.teardown(generation, e.into());
                return;
            }
        };
        codec.feed(&chunk[..n]);
        // Drain every fully buffered message before reading again.
        loop {
            match codec.try_decode() {
                Ok(Some(message)) => {
                    trace!(kind = message.kind(), "received message");
                    if let Err(e) = shared.dispatch(message).await {
                        shared.teardown(generation, e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    shared.teardown(generation, e);
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut write_half: W,
    generation: u64,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut rx = tokio::select! {
        _ = shutdown.cancelled() => return,
        guard = shared.outbound_rx.lock() => guard,
    };
    loop {
        let body = tokio::select! {
            _ = shutdown.cancelled() => return,
            item = rx.recv() => match item {
                Some(body) => body,
                None => return,
            },
        };
        let written = async {
            write_half.write_all(&body).await?;
            write_half.flush().await
        }
        .await;
        if let Err(e) = written {
            // Keep the unsent message if the queue has spare capacity. This
            // trades possible duplicate delivery after reconnect for fewer
            // silent losses; when full, the message is dropped and logged.
            if shared.outbound_tx.try_send(body).is_err() {
                warn!("outbound queue full, dropping unsent message");
            }
            shared.teardown(generation, e.into());
            return;
        }
    }
}
