//! Named periodic loops of a manager process.
//!
//! The primary runs its health monitor and metadata snapshot loop through one
//! [`BackgroundTaskRegistry`]. Every loop selects on a shared `watch` shutdown
//! flag between ticks, so a stop request takes effect at the next await point
//! and a tick that is already running finishes first.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How a shutdown went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    /// Tasks that missed the deadline and were aborted.
    pub aborted: usize,
}

pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            tasks: HashMap::new(),
            stop_tx,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run `task` every `interval` until shutdown; the first tick fires
    /// immediately and `task` receives the tick number. Registering a name
    /// that is already running replaces the old loop.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if self.is_shutting_down() {
            warn!(task = name, "Registry is shutting down, task not started");
            return;
        }

        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                task(tick).await;
                tick = tick.wrapping_add(1);
            }
            debug!(task = name, ticks = tick, "Background task stopped");
        });

        if let Some(previous) = self.tasks.insert(name, handle) {
            previous.abort();
            debug!(task = name, "Replaced running task");
        }
        info!(task = name, interval_ms = interval.as_millis() as u64, "Background task started");
    }

    /// Signal every loop and wait up to `timeout` overall for them to exit.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.stop_tx.send_replace(true) {
            return report;
        }

        let deadline = Instant::now() + timeout;
        for (name, handle) in self.tasks.drain() {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => report.stopped += 1,
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "Background task panicked");
                    report.stopped += 1;
                }
                Err(_) => {
                    warn!(task = name, "Background task missed the shutdown deadline");
                    abort.abort();
                    report.aborted += 1;
                }
            }
        }
        info!(
            stopped = report.stopped,
            aborted = report.aborted,
            "Background tasks shut down"
        );
        report
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        for handle in self.tasks.values() {
            handle.abort();
        }
    }
}
