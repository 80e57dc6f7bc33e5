//! Background timer that drives the policy pipeline

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{Recurrence, ShutdownSignal};

/// Fires a job at each occurrence of a recurrence.
///
/// Runs are serialized: the job is awaited before the next occurrence is
/// computed, so a slow run delays (never overlaps) the next one. Occurrences
/// that pass while a run is in progress, or while the process was down, are
/// not backfilled.
pub struct Scheduler {
    stop: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the timer loop. It ends when `shutdown` trips or `stop()` is called.
    pub fn start<R, F, Fut>(recurrence: R, shutdown: ShutdownSignal, job: F) -> Self
    where
        R: Recurrence + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = ShutdownSignal::new();
        let task = tokio::spawn(run_loop(recurrence, shutdown, stop.clone(), job));

        Self {
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// Halt future firings and wait for the loop to exit.
    ///
    /// A run already in progress is allowed to finish first. Once this
    /// returns the job will not be invoked again.
    pub async fn stop(&self) {
        self.stop.trigger();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
            debug!("Scheduler stopped");
        }
    }

    /// `stop`, bounded by `limit`. Returns false if a run was still in
    /// progress when the limit passed.
    pub async fn stop_within(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.stop()).await.is_ok()
    }
}

async fn run_loop<R, F, Fut>(recurrence: R, shutdown: ShutdownSignal, stop: ShutdownSignal, job: F)
where
    R: Recurrence,
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let halted = || shutdown.is_shutting_down() || stop.is_shutting_down();

    while !halted() {
        let now = janitor_util::now();
        let next = recurrence.next_after(now);
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        debug!(
            next = %next,
            delay = %janitor_util::format_duration(delay),
            "Next tick scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => break,
            _ = stop.wait() => break,
        }

        if halted() {
            break;
        }

        debug!(scheduled_for = %next, "Tick firing");
        job().await;
    }

    info!("Scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Every(Duration);

    impl Recurrence for Every {
        fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
            after + chrono::Duration::from_std(self.0).unwrap()
        }
    }

    #[tokio::test]
    async fn test_fires_repeatedly() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let scheduler = Scheduler::start(
            Every(Duration::from_millis(10)),
            ShutdownSignal::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_slow_runs_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, m, r) = (active.clone(), max_active.clone(), runs.clone());
        let scheduler = Scheduler::start(
            Every(Duration::from_millis(5)),
            ShutdownSignal::new(),
            move || {
                let (a, m, r) = (a.clone(), m.clone(), r.clone());
                async move {
                    let now_active = a.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now_active, Ordering::SeqCst);
                    // Much longer than the interval
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    r.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_firing_after_stop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let scheduler = Scheduler::start(
            Every(Duration::from_millis(5)),
            ShutdownSignal::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);

        // Stopping again is harmless
        scheduler.stop().await;
    }

    /// Job that flags when it starts and when it finishes
    fn tracked_job(
        run_for: Duration,
    ) -> (
        Arc<AtomicUsize>,
        Arc<AtomicUsize>,
        impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    ) {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (started.clone(), finished.clone());
        let job = move || {
            let (s, f) = (s.clone(), f.clone());
            Box::pin(async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(run_for).await;
                f.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (started, finished, job)
    }

    #[tokio::test]
    async fn test_in_flight_run_finishes_after_shutdown() {
        let shutdown = ShutdownSignal::new();
        let (started, finished, job) = tracked_job(Duration::from_millis(80));
        let scheduler = Scheduler::start(Every(Duration::from_millis(5)), shutdown.clone(), job);

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        shutdown.trigger();

        assert!(scheduler.stop_within(Duration::from_secs(2)).await);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_within_gives_up_on_a_hung_run() {
        let shutdown = ShutdownSignal::new();
        let (started, finished, job) = tracked_job(Duration::from_secs(3600));
        let scheduler = Scheduler::start(Every(Duration::from_millis(5)), shutdown.clone(), job);

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        shutdown.trigger();

        assert!(!scheduler.stop_within(Duration::from_millis(50)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_ends_loop() {
        let shutdown = ShutdownSignal::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let scheduler = Scheduler::start(
            Every(Duration::from_secs(3600)),
            shutdown.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .expect("loop exits promptly on shutdown");

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
