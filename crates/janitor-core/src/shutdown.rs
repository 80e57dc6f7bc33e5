//! Ordered, run-once teardown

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Process-wide "shutdown has begun" flag.
///
/// Trips once and stays tripped. Long-running loops either poll
/// `is_shutting_down()` or `select!` on `wait()`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the signal. Returns true only for the call that tripped it.
    pub fn trigger(&self) -> bool {
        let tripped = self.tx.send_if_modified(|shutting_down| {
            if *shutting_down {
                false
            } else {
                *shutting_down = true;
                true
            }
        });

        if tripped {
            debug!("Shutdown signal triggered");
        }
        tripped
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal has been triggered (immediately if it already was)
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once tripped.
        let _ = rx.wait_for(|shutting_down| *shutting_down).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Teardown order. Steps run in ascending stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TeardownStage {
    /// Stop accepting control-plane connections
    Listener,
    /// Close the orchestration client
    RemoteClient,
    /// Release the data store
    Store,
}

/// What started the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::Fatal(cause) => write!(f, "fatal error: {}", cause),
        }
    }
}

/// Result of one teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub stage: TeardownStage,
    pub name: String,
    pub error: Option<String>,
}

/// Everything that happened during the single shutdown run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub steps: Vec<StepOutcome>,
}

impl ShutdownReport {
    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }
}

type StepFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct Step {
    stage: TeardownStage,
    name: String,
    run: Box<dyn FnOnce() -> StepFuture + Send>,
}

/// Runs registered teardown steps exactly once, in stage order.
///
/// A failing (or panicking) step is logged and recorded; the remaining steps
/// still run.
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    /// `None` once `run` has taken the steps
    steps: Mutex<Option<Vec<Step>>>,
}

impl ShutdownCoordinator {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self {
            signal,
            steps: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Register a teardown step. Steps within a stage run in registration order.
    ///
    /// Returns false, and drops the step, once shutdown has begun.
    pub fn add_step<F, Fut, E>(&self, stage: TeardownStage, name: impl Into<String>, step: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        let mut steps = lock(&self.steps);
        let Some(steps) = steps.as_mut() else {
            warn!(step = %name, "Teardown step registered after shutdown began, ignoring");
            return false;
        };

        steps.push(Step {
            stage,
            name,
            run: Box::new(move || Box::pin(async move { step().await.map_err(|e| e.to_string()) })),
        });
        true
    }

    /// Trip the shutdown signal and run every step.
    ///
    /// Returns `None` if shutdown already ran (or is running).
    pub async fn run(&self, reason: ShutdownReason) -> Option<ShutdownReport> {
        let Some(mut steps) = lock(&self.steps).take() else {
            debug!(reason = %reason, "Shutdown already in progress");
            return None;
        };

        info!(reason = %reason, "Shutting down");
        self.signal.trigger();

        steps.sort_by_key(|step| step.stage);

        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            let started = Instant::now();
            let error = match tokio::spawn((step.run)()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(join_error) if join_error.is_panic() => Some("step panicked".to_string()),
                Err(join_error) => Some(join_error.to_string()),
            };

            match &error {
                None => info!(
                    stage = ?step.stage,
                    step = %step.name,
                    elapsed = %janitor_util::format_duration(started.elapsed()),
                    "Teardown step completed"
                ),
                Some(e) => warn!(
                    stage = ?step.stage,
                    step = %step.name,
                    error = %e,
                    "Teardown step failed, continuing"
                ),
            }

            outcomes.push(StepOutcome {
                stage: step.stage,
                name: step.name,
                error,
            });
        }

        let report = ShutdownReport {
            reason,
            steps: outcomes,
        };
        info!(clean = report.all_succeeded(), "Shutdown complete");

        Some(report)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
