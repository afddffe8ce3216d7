//! Owner of the node's recurring background tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How long `shutdown` waits for a task before aborting it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Receiver handed to continuous tasks so they can watch for shutdown.
pub type ShutdownRx = broadcast::Receiver<()>;

/// Runs named tasks and cancels all of them on shutdown.
///
/// Periodic tasks run their body, then wait for the period, so the effective
/// interval drifts by the body's latency. A task never overlaps itself.
pub struct Scheduler {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    stopped: AtomicBool,
    grace: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Set how long shutdown waits for each task.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run `task` now and again `period` after each run completes.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, move |mut shutdown| async move {
            loop {
                task().await;

                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
    }

    /// Run a continuous task that is expected to watch `shutdown` itself.
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(ShutdownRx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(task = name, "Scheduler already stopped, not starting task");
            return;
        }

        let future = task(self.shutdown_tx.subscribe());
        let handle = tokio::spawn(async move {
            future.await;
            tracing::debug!(task = name, "Scheduled task stopped");
        });

        tracing::debug!(task = name, "Scheduled task started");
        self.lock_tasks().push((name, handle));
    }

    /// Number of tasks that have not finished.
    pub fn active(&self) -> usize {
        self.lock_tasks()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Names of the tasks that have not finished.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.lock_tasks()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Signal every task to stop and wait for them, aborting stragglers.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let tasks = std::mem::take(&mut *self.lock_tasks());
        for (name, mut handle) in tasks {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        tracing::debug!("Scheduler stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<(&'static str, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
