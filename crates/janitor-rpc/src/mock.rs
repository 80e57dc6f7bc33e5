//! In-process orchestration server for tests
//!
//! Speaks the same NDJSON protocol as the real service: authenticates the
//! first request on each connection, records every accepted action and
//! answers with a receipt.

use janitor_api::{
    Action, ActionReceipt, Command, ErrorCode, ErrorInfo, JANITOR_CREDENTIAL_KIND, Request,
    Response, ResponsePayload,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Shared {
    secret: String,
    actions: Mutex<Vec<Action>>,
    reject: AtomicBool,
    accepted: AtomicUsize,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

/// Orchestration service double bound to a loopback port
pub struct MockOrchestrator {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockOrchestrator {
    /// Bind an ephemeral loopback port and start accepting connections
    pub async fn start(secret: impl Into<String>) -> std::io::Result<Self> {
        Self::start_on(SocketAddr::from(([127, 0, 0, 1], 0)), secret).await
    }

    /// Start on a specific address, e.g. to come back on the port a previous instance used
    pub async fn start_on(addr: SocketAddr, secret: impl Into<String>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            secret: secret.into(),
            actions: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                        debug!(peer = %peer, "Mock orchestrator accepted connection");

                        let conn_shared = accept_shared.clone();
                        let task = tokio::spawn(serve_connection(stream, conn_shared));
                        lock(&accept_shared.connections).push(task);
                    }
                    Err(e) => {
                        warn!(error = %e, "Mock orchestrator failed to accept connection");
                    }
                }
            }
        });

        info!(addr = %addr, "Mock orchestrator listening");

        Ok(Self {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Actions accepted so far, in arrival order
    pub fn actions(&self) -> Vec<Action> {
        lock(&self.shared.actions).clone()
    }

    /// Number of connections accepted since start
    pub fn connection_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Refuse subsequent actions with `rejected`
    pub fn set_reject(&self, reject: bool) {
        self.shared.reject.store(reject, Ordering::SeqCst);
    }

    /// Sever every open connection while continuing to accept new ones
    pub fn drop_connections(&self) {
        for task in lock(&self.shared.connections).drain(..) {
            task.abort();
        }
    }

    /// Stop listening and sever every open connection
    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl Drop for MockOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut authenticated = false;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Mock orchestrator read error");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Mock orchestrator received invalid request");
                continue;
            }
        };

        let (response, keep_open) = handle_request(&shared, &mut authenticated, request);

        let Ok(mut json) = serde_json::to_string(&response) else {
            break;
        };
        json.push('\n');
        if writer.write_all(json.as_bytes()).await.is_err() || !keep_open {
            break;
        }
    }
}

fn handle_request(shared: &Shared, authenticated: &mut bool, request: Request) -> (Response, bool) {
    let id = request.request_id;

    match request.command {
        Command::Authenticate { credential } => {
            if credential.kind == JANITOR_CREDENTIAL_KIND && credential.key == shared.secret {
                *authenticated = true;
                (Response::success(id, ResponsePayload::Authenticated), true)
            } else {
                let info = ErrorInfo::new(ErrorCode::Unauthorized, "invalid credential");
                (Response::error(id, info), false)
            }
        }
        _ if !*authenticated => {
            let info = ErrorInfo::new(ErrorCode::NotAuthenticated, "authenticate first");
            (Response::error(id, info), false)
        }
        Command::Ping => (Response::success(id, ResponsePayload::Pong), true),
        Command::Action { action } => {
            if shared.reject.load(Ordering::SeqCst) {
                let info = ErrorInfo::new(
                    ErrorCode::Rejected,
                    format!("{} refused", action.kind()),
                );
                return (Response::error(id, info), true);
            }

            lock(&shared.actions).push(action);
            let receipt = ActionReceipt {
                action_id: uuid::Uuid::new_v4().to_string(),
                accepted_at: chrono::Utc::now(),
            };
            (
                Response::success(id, ResponsePayload::ActionAccepted { receipt }),
                true,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use janitor_api::{Credential, ResponseResult};

    async fn roundtrip(stream: &mut BufReader<TcpStream>, request: &Request) -> Response {
        let mut json = serde_json::to_string(request).unwrap();
        json.push('\n');
        stream.get_mut().write_all(json.as_bytes()).await.unwrap();

        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn test_requires_authentication_first() {
        let mock = MockOrchestrator::start("key").await.unwrap();
        let mut stream = BufReader::new(TcpStream::connect(mock.addr()).await.unwrap());

        let response = roundtrip(&mut stream, &Request::new(1, Command::Ping)).await;
        match response.result {
            ResponseResult::Err(info) => assert_eq!(info.code, ErrorCode::NotAuthenticated),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authenticated_ping() {
        let mock = MockOrchestrator::start("key").await.unwrap();
        let mut stream = BufReader::new(TcpStream::connect(mock.addr()).await.unwrap());

        let auth = Request::new(
            1,
            Command::Authenticate {
                credential: Credential::janitor("key"),
            },
        );
        let response = roundtrip(&mut stream, &auth).await;
        assert!(matches!(
            response.result,
            ResponseResult::Ok(ResponsePayload::Authenticated)
        ));

        let response = roundtrip(&mut stream, &Request::new(2, Command::Ping)).await;
        assert_eq!(response.request_id, 2);
        assert!(matches!(
            response.result,
            ResponseResult::Ok(ResponsePayload::Pong)
        ));
        assert_eq!(mock.connection_count(), 1);
    }
}
