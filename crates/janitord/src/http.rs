//! HTTP control plane: version and liveness

use axum::Router;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name this worker reports about itself
pub const WORKER_NAME: &str = "janitor";

/// Version this worker reports about itself
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `stop()` waits for in-flight requests before abandoning them
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the control-plane router.
///
/// Used by [`ControlPlane::serve`] and available for testing with `oneshot`.
pub fn build_router() -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/healthCheck", get(health_check))
}

async fn version() -> &'static str {
    WORKER_VERSION
}

async fn health_check() -> String {
    format!("{} is running with version: {}", WORKER_NAME, WORKER_VERSION)
}

/// The running HTTP server
pub struct ControlPlane {
    local_addr: SocketAddr,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// `Some(outcome)` once the server task has ended; outcome carries any serve error
    exited: watch::Receiver<Option<Result<(), String>>>,
}

impl ControlPlane {
    /// Start serving on an already-bound listener.
    ///
    /// Binding is left to the caller so a bind failure surfaces before
    /// anything else starts, and so tests can bind port 0.
    pub fn serve(listener: TcpListener) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exited_tx, exited) = watch::channel(None);

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, build_router())
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
                .map_err(|e| e.to_string());

            if let Err(e) = &result {
                warn!(error = %e, "Control plane server failed");
            }
            let _ = exited_tx.send(Some(result));
        });

        info!(addr = %local_addr, "Control plane listening");

        Ok(Self {
            local_addr,
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            exited,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolve when the server task ends on its own or after `stop()`.
    ///
    /// Returns the serve error, if there was one.
    pub async fn exited(&self) -> Result<(), String> {
        let mut exited = self.exited.clone();
        match exited.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            Err(_) => Err("control plane task ended without reporting".to_string()),
        }
    }

    /// Stop accepting connections and wait (bounded) for the server to exit.
    ///
    /// The listening socket is closed when this returns. Idempotent.
    pub async fn stop(&self) -> Result<(), String> {
        if let Some(stop_tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stop_tx.send(());
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return Ok(());
        };

        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {
                debug!(addr = %self.local_addr, "Control plane stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(format!("control plane task failed: {}", e)),
            Err(_) => {
                task.abort();
                let _ = task.await;
                Err(format!(
                    "in-flight requests did not finish within {:?}; connections dropped",
                    STOP_TIMEOUT
                ))
            }
        }
    }
}
