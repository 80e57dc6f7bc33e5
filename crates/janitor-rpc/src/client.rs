//! Remote client implementation

use async_trait::async_trait;
use janitor_api::{
    Action, ActionReceipt, Command, Credential, ErrorCode, Request, Response, ResponsePayload,
    ResponseResult,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{RemoteActions, RpcError, RpcResult};

/// Tunables for [`RemoteClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on establishing a connection and completing authentication
    pub dial_timeout: Duration,
    /// Bound on waiting for the response to a single request
    pub request_timeout: Duration,
    /// Re-establish the connection after a transport failure
    pub auto_reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

struct Connection {
    writer: OwnedWriteHalf,
    reader_task: JoinHandle<()>,
    generation: u64,
}

struct Inner {
    endpoint: String,
    credential: Credential,
    options: ClientOptions,
    conn: Mutex<Option<Connection>>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Response>>>,
    state: StdMutex<ConnectionState>,
    closed: AtomicBool,
    next_request_id: AtomicU64,
    generation: AtomicU64,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Authenticated client for the orchestration service.
///
/// Cheap to clone; all clones share one connection. Requests are multiplexed
/// over the connection and matched to responses by `request_id`.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<Inner>,
}

impl RemoteClient {
    /// Connect and authenticate.
    ///
    /// Makes exactly one attempt bounded by `options.dial_timeout`. A rejected
    /// credential is reported as [`RpcError::Unauthorized`]; anything else that
    /// prevents the handshake is [`RpcError::Unreachable`].
    pub async fn connect(
        endpoint: impl Into<String>,
        credential: Credential,
        options: ClientOptions,
    ) -> RpcResult<Self> {
        let inner = Arc::new(Inner {
            endpoint: endpoint.into(),
            credential,
            options,
            conn: Mutex::new(None),
            pending: StdMutex::new(HashMap::new()),
            state: StdMutex::new(ConnectionState::Connecting),
            closed: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            reconnect_task: StdMutex::new(None),
        });

        match inner.dial().await {
            Ok((reader, writer)) => {
                inner.install(reader, writer).await;
            }
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        info!(endpoint = %inner.endpoint, "Connected to orchestration service");

        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_guard()
    }

    /// Round-trip a `ping` command
    pub async fn ping(&self) -> RpcResult<()> {
        match self.request(Command::Ping).await? {
            ResponsePayload::Pong => Ok(()),
            other => Err(RpcError::Protocol(format!("expected pong, got {:?}", other))),
        }
    }

    /// Close the connection. Idempotent; later requests fail with [`RpcError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock(&self.inner.reconnect_task).take() {
            task.abort();
        }

        let conn = self.inner.conn.lock().await.take();
        if let Some(mut conn) = conn {
            conn.reader_task.abort();
            if let Err(e) = conn.writer.shutdown().await {
                debug!(error = %e, "Error shutting down connection");
            }
        }

        self.inner.fail_pending();
        self.inner.set_state(ConnectionState::Closed);

        info!(endpoint = %self.inner.endpoint, "Remote client closed");
    }

    async fn request(&self, command: Command) -> RpcResult<ResponsePayload> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }

        let request_id = inner.next_id();
        let mut line = serde_json::to_string(&Request::new(request_id, command))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = inner.conn.lock().await;
            if inner.closed.load(Ordering::SeqCst) {
                return Err(RpcError::Closed);
            }

            let Some(conn) = guard.as_mut() else {
                return Err(RpcError::Transient(format!(
                    "not connected to {}",
                    inner.endpoint
                )));
            };

            lock(&inner.pending).insert(request_id, tx);

            if let Err(e) = conn.writer.write_all(line.as_bytes()).await {
                let generation = conn.generation;
                drop(guard);
                lock(&inner.pending).remove(&request_id);
                inner.connection_lost(generation).await;
                return Err(RpcError::Transient(format!("write failed: {}", e)));
            }
        }

        let response = match tokio::time::timeout(inner.options.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(if inner.closed.load(Ordering::SeqCst) {
                    RpcError::Closed
                } else {
                    RpcError::Transient("connection lost before a response arrived".into())
                });
            }
            Err(_) => {
                lock(&inner.pending).remove(&request_id);
                return Err(RpcError::Timeout(inner.options.request_timeout));
            }
        };

        match response.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(info) => Err(RpcError::Rejected {
                code: info.code,
                message: info.message,
            }),
        }
    }
}

#[async_trait]
impl RemoteActions for RemoteClient {
    async fn issue(&self, action: Action) -> RpcResult<ActionReceipt> {
        let kind = action.kind();
        match self.request(Command::Action { action }).await? {
            ResponsePayload::ActionAccepted { receipt } => {
                debug!(action = kind, action_id = %receipt.action_id, "Action accepted");
                Ok(receipt)
            }
            other => Err(RpcError::Protocol(format!(
                "expected action_accepted, got {:?}",
                other
            ))),
        }
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn state_guard(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state_guard() = state;
    }

    /// One bounded connect-and-authenticate attempt
    async fn dial(&self) -> RpcResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let dial_timeout = self.options.dial_timeout;
        let attempt = handshake(&self.endpoint, &self.credential, self.next_id());

        match tokio::time::timeout(dial_timeout, attempt).await {
            Ok(Ok(halves)) => Ok(halves),
            Ok(Err(e @ RpcError::Unauthorized(_))) => Err(e),
            Ok(Err(e)) => Err(RpcError::Unreachable {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RpcError::Unreachable {
                endpoint: self.endpoint.clone(),
                reason: format!("handshake did not complete within {:?}", dial_timeout),
            }),
        }
    }

    /// Make a freshly authenticated connection the current one.
    ///
    /// Returns false if the client was closed in the meantime.
    async fn install(
        self: &Arc<Self>,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> bool {
        let mut guard = self.conn.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader_task = tokio::spawn(read_responses(Arc::downgrade(self), reader, generation));

        *guard = Some(Connection {
            writer,
            reader_task,
            generation,
        });
        self.set_state(ConnectionState::Connected);

        true
    }

    /// Tear down connection `generation` after a transport failure.
    ///
    /// Only the first report for a given generation has any effect, so a
    /// single reconnect loop runs per lost connection.
    async fn connection_lost(self: &Arc<Self>, generation: u64) {
        let lost = {
            let mut guard = self.conn.lock().await;
            match guard.as_ref() {
                Some(conn) if conn.generation == generation => guard.take(),
                _ => return,
            }
        };
        drop(lost);

        self.fail_pending();

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if !self.options.auto_reconnect {
            warn!(endpoint = %self.endpoint, "Connection to orchestration service lost");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!(endpoint = %self.endpoint, "Connection to orchestration service lost, reconnecting");
        self.set_state(ConnectionState::Connecting);

        let task = tokio::spawn(reconnect(Arc::downgrade(self)));
        if let Some(previous) = lock(&self.reconnect_task).replace(task) {
            previous.abort();
        }
    }

    /// Dropping the senders wakes every waiter with a transient failure
    fn fail_pending(&self) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing in-flight requests");
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn handshake(
    endpoint: &str,
    credential: &Credential,
    request_id: u64,
) -> RpcResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(endpoint).await?;
    stream.set_nodelay(true)?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = Request::new(
        request_id,
        Command::Authenticate {
            credential: credential.clone(),
        },
    );
    let mut json = serde_json::to_string(&request)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Transient(
            "connection closed during authentication".into(),
        ));
    }

    let response: Response = serde_json::from_str(line.trim())?;
    match response.result {
        ResponseResult::Ok(ResponsePayload::Authenticated) => Ok((reader, writer)),
        ResponseResult::Ok(other) => Err(RpcError::Protocol(format!(
            "expected authenticated, got {:?}",
            other
        ))),
        ResponseResult::Err(info) if info.code == ErrorCode::Unauthorized => {
            Err(RpcError::Unauthorized(info.message))
        }
        ResponseResult::Err(info) => Err(RpcError::Rejected {
            code: info.code,
            message: info.message,
        }),
    }
}

async fn read_responses(inner: Weak<Inner>, mut reader: BufReader<OwnedReadHalf>, generation: u64) {
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(generation, "Orchestration service closed the connection");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response: Response = match serde_json::from_str(trimmed) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Invalid response from orchestration service");
                        continue;
                    }
                };

                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let waiter = lock(&inner.pending).remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(request_id = response.request_id, "Response for unknown request");
                    }
                }
            }
            Err(e) => {
                debug!(generation, error = %e, "Read error");
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(generation).await;
    }
}

// Boxed so the reader -> reconnect -> reader task cycle has a nameable type.
fn reconnect(inner: Weak<Inner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(reconnect_loop(inner))
}

async fn reconnect_loop(inner: Weak<Inner>) {
    let Some(options) = inner.upgrade().map(|i| i.options.clone()) else {
        return;
    };
    let mut backoff = options.initial_backoff;
    let mut attempt: u32 = 0;

    loop {
        tokio::time::sleep(backoff).await;
        attempt += 1;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        match inner.dial().await {
            Ok((reader, writer)) => {
                if inner.install(reader, writer).await {
                    info!(endpoint = %inner.endpoint, attempt, "Reconnected to orchestration service");
                }
                return;
            }
            Err(e) => {
                debug!(attempt, error = %e, "Reconnect attempt failed");
            }
        }

        backoff = (backoff * 2).min(options.max_backoff);
    }
}
