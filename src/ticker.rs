//! Background task plumbing.
//!
//! A [`TaskGroup`] owns the tasks spawned by one participant (fetch loops,
//! scheduler and GC workers) and stops them together through a broadcast
//! shutdown signal. Periodic work implements [`TickTask`] and runs on a
//! fixed interval; a failed tick is logged and the next one still runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;

/// Work run once per tick.
#[async_trait]
pub trait TickTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self) -> Result<(), BrokerError>;
}

/// Tasks sharing one shutdown signal.
pub struct TaskGroup {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Receiver that fires when [`TaskGroup::shutdown`] is called.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push((name.into(), tokio::spawn(future)));
    }

    /// Spawns `task` to run every `interval` until shutdown.
    pub fn spawn_ticker(&mut self, task: Arc<dyn TickTask>, interval: Duration) {
        let name = task.name();
        let shutdown_rx = self.shutdown_receiver();
        self.spawn(name, run_ticker(task, interval, shutdown_rx));
    }

    /// Signals shutdown and waits up to `timeout` for every task.
    ///
    /// Tasks still running at the deadline are aborted.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ShutdownTimeout` if any task had to be aborted.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), BrokerError> {
        // Ignore send error - tasks may have already stopped
        let _ = self.shutdown_tx.send(());

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        for (name, mut handle) in self.handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!(task = %name, "Task cancelled"),
                Ok(Err(e)) => error!(task = %name, error = %e, "Task panicked"),
                Err(_) => {
                    warn!(task = %name, "Task did not stop in time, aborting");
                    handle.abort();
                    timed_out = true;
                }
            }
        }

        if timed_out {
            Err(BrokerError::ShutdownTimeout(timeout))
        } else {
            Ok(())
        }
    }
}

async fn run_ticker(
    task: Arc<dyn TickTask>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(worker = task.name(), interval_ms = interval.as_millis() as u64, "Worker started");

    loop {
        if let Err(e) = task.tick().await {
            warn!(worker = task.name(), error = %e, "Tick failed");
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(worker = task.name(), "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter {
        ticks: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl TickTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&self) -> Result<(), BrokerError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BrokerError::Uninitialized("store"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_ticker_runs_until_shutdown() {
        let counter = Arc::new(Counter {
            ticks: AtomicU64::new(0),
            fail: false,
        });
        let mut group = TaskGroup::new();
        group.spawn_ticker(counter.clone(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        group.shutdown(Duration::from_secs(1)).await.unwrap();

        let seen = counter.ticks.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_running() {
        let counter = Arc::new(Counter {
            ticks: AtomicU64::new(0),
            fail: true,
        });
        let mut group = TaskGroup::new();
        group.spawn_ticker(counter.clone(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        group.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(counter.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_task() {
        let mut group = TaskGroup::new();
        group.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(group.len(), 1);

        let result = group.shutdown(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BrokerError::ShutdownTimeout(_))));
        assert!(group.is_empty());
    }
}
