//! Worker supervision and cooperative shutdown.
//!
//! Each consumer worker runs in its own task, wrapped by a supervising task
//! that restarts it after `restart_delay` if it panics or returns while no
//! shutdown was requested. Shutdown is cooperative: workers observe the
//! [`ShutdownToken`] between cycles, so a cycle in progress always finishes
//! and leaves no item half-handled.

use crate::worker::ConsumerWorker;
use crate::QueueType;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Token for signaling graceful shutdown to workers
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one supervised task per consumer worker
#[derive(Debug)]
pub struct WorkerSupervisor {
    shutdown: ShutdownToken,
    handles: Vec<(QueueType, JoinHandle<()>)>,
    restarts: Arc<AtomicU64>,
}

impl WorkerSupervisor {
    /// Spawn a supervised task for every worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        workers: Vec<ConsumerWorker>,
        restart_delay: Duration,
        shutdown: ShutdownToken,
    ) -> Self {
        let restarts = Arc::new(AtomicU64::new(0));

        let handles = workers
            .into_iter()
            .map(|worker| {
                let queue_type = worker.queue_type();
                let handle = tokio::spawn(supervise(
                    worker,
                    restart_delay,
                    shutdown.clone(),
                    restarts.clone(),
                ));
                (queue_type, handle)
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Worker supervisor started");

        Self {
            shutdown,
            handles,
            restarts,
        }
    }

    /// Token observed by every supervised worker
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Queue types with a supervised worker
    pub fn queue_types(&self) -> Vec<QueueType> {
        self.handles.iter().map(|(qt, _)| *qt).collect()
    }

    /// Number of worker restarts since start
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Request shutdown and wait up to `timeout` for every worker to stop
    ///
    /// Returns `true` if all workers finished their current cycle and
    /// stopped within the timeout.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.shutdown.cancel();

        let handles = self.handles;
        let wait_all = async move {
            for (queue_type, handle) in handles {
                if let Err(e) = handle.await {
                    error!(queue_type = %queue_type, error = %e, "Supervisor task failed");
                }
            }
        };

        match tokio::time::timeout(timeout, wait_all).await {
            Ok(()) => {
                info!("All workers stopped");
                true
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Workers did not stop in time");
                false
            }
        }
    }
}

async fn supervise(
    worker: ConsumerWorker,
    restart_delay: Duration,
    shutdown: ShutdownToken,
    restarts: Arc<AtomicU64>,
) {
    let queue_type = worker.queue_type();

    loop {
        let run = {
            let worker = worker.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { worker.run(token).await })
        };
        let result = run.await;

        if shutdown.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => warn!(queue_type = %queue_type, "Worker loop exited unexpectedly"),
            Err(e) if e.is_panic() => error!(queue_type = %queue_type, "Worker loop panicked"),
            Err(e) => error!(queue_type = %queue_type, error = %e, "Worker task failed"),
        }

        restarts.fetch_add(1, Ordering::SeqCst);
        info!(
            queue_type = %queue_type,
            delay_ms = restart_delay.as_millis() as u64,
            "Restarting worker"
        );

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
