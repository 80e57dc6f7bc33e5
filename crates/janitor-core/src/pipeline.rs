//! Ordered, fault-isolated execution of policy checks

use chrono::{DateTime, Utc};
use janitor_rpc::RemoteActions;
use janitor_store::Store;
use janitor_util::{TickId, format_duration};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{CheckContext, ErrorKind, PolicyCheck, PolicyResult};

/// The registered checks plus the collaborators they run against
pub struct PolicyPipeline {
    checks: Vec<Arc<dyn PolicyCheck>>,
    store: Arc<dyn Store>,
    remote: Arc<dyn RemoteActions>,
    /// Held for the duration of a tick so two ticks never interleave
    running: Mutex<()>,
}

impl PolicyPipeline {
    pub fn new(store: Arc<dyn Store>, remote: Arc<dyn RemoteActions>) -> Self {
        Self {
            checks: Vec::new(),
            store,
            remote,
            running: Mutex::new(()),
        }
    }

    /// Append a check; checks run in the order they were added.
    ///
    /// # Panics
    ///
    /// If a check with the same name is already registered. Results are
    /// reported by name, so names must be unique.
    pub fn with_check(self, check: impl PolicyCheck + 'static) -> Self {
        self.with_checks([Arc::new(check) as Arc<dyn PolicyCheck>])
    }

    pub fn with_checks(mut self, checks: impl IntoIterator<Item = Arc<dyn PolicyCheck>>) -> Self {
        for check in checks {
            assert!(
                self.checks.iter().all(|c| c.name() != check.name()),
                "policy check {:?} registered twice",
                check.name()
            );
            self.checks.push(check);
        }
        self
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check once against the current time
    pub async fn run_once(&self) -> Vec<PolicyResult> {
        self.run_once_at(janitor_util::now()).await
    }

    /// Run every check once, in registration order.
    ///
    /// Always returns exactly one result per registered check. A check that
    /// errors or panics yields a result carrying the error; the remaining
    /// checks still run.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Vec<PolicyResult> {
        let _running = self.running.lock().await;

        let tick = TickId::new();
        let started = Instant::now();
        info!(tick = %tick, checks = self.checks.len(), "Policy tick started");

        let ctx = CheckContext {
            store: self.store.clone(),
            remote: self.remote.clone(),
            now,
            tick,
        };

        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            results.push(run_check(check.clone(), ctx.clone()).await);
        }

        for result in &results {
            log_result(&tick, result);
        }

        info!(
            tick = %tick,
            elapsed = %format_duration(started.elapsed()),
            errors = results.iter().filter(|r| r.is_error()).count(),
            "Policy tick finished"
        );

        results
    }
}

/// Run one check on its own task so a panic is contained to that check
async fn run_check(check: Arc<dyn PolicyCheck>, ctx: CheckContext) -> PolicyResult {
    let check_name = check.name().to_string();
    let started = Instant::now();

    let handle = tokio::spawn(async move { check.evaluate(&ctx).await });

    let (affected_count, failed_count, message, error) = match handle.await {
        Ok(Ok(outcome)) => (outcome.affected, outcome.failed, outcome.message, None),
        Ok(Err(e)) => (0, 0, e.to_string(), Some(e.kind())),
        Err(join_error) if join_error.is_panic() => (
            0,
            0,
            format!("check panicked: {}", panic_message(join_error.into_panic())),
            Some(ErrorKind::ExecutionFailure),
        ),
        Err(join_error) => (0, 0, join_error.to_string(), Some(ErrorKind::ExecutionFailure)),
    };

    PolicyResult {
        check_name,
        affected_count,
        failed_count,
        message,
        error,
        elapsed: started.elapsed(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_result(tick: &TickId, result: &PolicyResult) {
    match result.error {
        None => info!(
            tick = %tick,
            check = %result.check_name,
            affected = result.affected_count,
            failed = result.failed_count,
            elapsed = %format_duration(result.elapsed),
            "{}",
            result.message
        ),
        Some(kind) => warn!(
            tick = %tick,
            check = %result.check_name,
            affected = result.affected_count,
            failed = result.failed_count,
            error = %kind,
            elapsed = %format_duration(result.elapsed),
            "{}",
            result.message
        ),
    }
}
