//! Per-connection bounded worker pool.
//!
//! Units of work are queued on an unbounded channel and pumped into a
//! [`JoinSet`] that never holds more than `max_workers` running tasks. The
//! pending count covers both queued and running work; `WAIT_PENDING` waits on
//! a completion counter published through a `watch` channel.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use rtm_core::ClientId;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics::UNDRAINED_TASKS_TOTAL;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Work was submitted after shutdown began.
#[derive(Debug, thiserror::Error)]
#[error("executor for {client_id} is shut down")]
pub struct ExecutorShutDown {
    /// Owning connection.
    pub client_id: ClientId,
}

struct ExecutorStats {
    pending: AtomicUsize,
    active: AtomicUsize,
    submitted: AtomicU64,
    completed: watch::Sender<u64>,
}

impl ExecutorStats {
    fn finish(&self) {
        let _ = self.active.fetch_sub(1, Ordering::AcqRel);
        let _ = self.pending.fetch_sub(1, Ordering::AcqRel);
        self.completed.send_modify(|done| *done += 1);
    }
}

/// Bounded, per-connection task executor.
pub struct ConnectionExecutor {
    client_id: ClientId,
    max_workers: usize,
    intake: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    stats: Arc<ExecutorStats>,
    drained: CancellationToken,
    terminated: AtomicBool,
    pump: AbortHandle,
}

impl ConnectionExecutor {
    /// Start an executor. Must be called inside a Tokio runtime.
    pub fn new(client_id: ClientId, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let (completed, _) = watch::channel(0);
        let stats = Arc::new(ExecutorStats {
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed,
        });
        let drained = CancellationToken::new();

        let pump = tokio::spawn(run_pump(
            client_id.clone(),
            rx,
            max_workers,
            Arc::clone(&stats),
            drained.clone(),
        ))
        .abort_handle();

        Self {
            client_id,
            max_workers,
            intake: Mutex::new(Some(tx)),
            stats,
            drained,
            terminated: AtomicBool::new(false),
            pump,
        }
    }

    /// Maximum concurrently running units of work.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Submit a unit of work.
    ///
    /// Returns immediately; the work runs once a worker slot is free. Units
    /// may complete in a different order than they were submitted.
    pub fn execute<F>(&self, job: F) -> Result<(), ExecutorShutDown>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let intake = self.intake.lock();
        let Some(tx) = intake.as_ref() else {
            return Err(self.shut_down_error());
        };
        let _ = self.stats.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(Box::pin(job)).is_err() {
            let _ = self.stats.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(self.shut_down_error());
        }
        let _ = self.stats.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Queued plus running units of work.
    pub fn pending_task_count(&self) -> usize {
        self.stats.pending.load(Ordering::Acquire)
    }

    /// Currently running units of work.
    pub fn active_task_count(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Wait until every unit submitted before this call has completed, or
    /// `max_wait` elapses.
    ///
    /// Work submitted after sampling is not waited for. Returns `true` when
    /// the sampled work finished in time.
    pub async fn wait_for_pending(&self, max_wait: Duration) -> bool {
        if self.pending_task_count() == 0 {
            return true;
        }
        let target = self.stats.submitted.load(Ordering::Acquire);
        let mut completed = self.stats.completed.subscribe();

        let reached = async {
            loop {
                let done = *completed.borrow_and_update();
                if done >= target {
                    return true;
                }
                if completed.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(max_wait, reached)
            .await
            .unwrap_or(false)
    }

    /// Stop intake and wait up to `timeout` for queued and running work.
    ///
    /// Returns whether the executor fully drained. Does not terminate
    /// remaining work; see [`force_stop`](Self::force_stop).
    pub async fn shutdown_coordinated(&self, timeout: Duration) -> bool {
        drop(self.intake.lock().take());
        if self.terminated.load(Ordering::Acquire) {
            return self.drained.is_cancelled();
        }
        tokio::time::timeout(timeout, self.drained.cancelled())
            .await
            .is_ok()
    }

    /// Abort all queued and running work. Returns the number of units
    /// discarded.
    pub fn force_stop(&self) -> usize {
        drop(self.intake.lock().take());
        if self.drained.is_cancelled() || self.terminated.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let undrained = self.pending_task_count();
        self.pump.abort();
        if undrained > 0 {
            warn!(
                client_id = %self.client_id,
                undrained,
                "executor did not drain in time, discarding remaining work"
            );
            counter!(UNDRAINED_TASKS_TOTAL).increment(undrained as u64);
        }
        undrained
    }

    /// Graceful drain bounded by `timeout`, then forced termination.
    ///
    /// Returns whether the executor drained without being forced.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.shutdown_coordinated(timeout).await;
        if !drained {
            let _ = self.force_stop();
        }
        drained
    }

    /// Whether intake has stopped.
    pub fn is_shut_down(&self) -> bool {
        self.intake.lock().is_none()
    }

    fn shut_down_error(&self) -> ExecutorShutDown {
        ExecutorShutDown {
            client_id: self.client_id.clone(),
        }
    }
}

impl Drop for ConnectionExecutor {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn run_pump(
    client_id: ClientId,
    mut rx: mpsc::UnboundedReceiver<Job>,
    max_workers: usize,
    stats: Arc<ExecutorStats>,
    drained: CancellationToken,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            Some(result) = running.join_next(), if !running.is_empty() => {
                reap(&client_id, result);
            }
            job = rx.recv(), if running.len() < max_workers => {
                let Some(job) = job else { break };
                let _ = stats.active.fetch_add(1, Ordering::AcqRel);
                let stats = Arc::clone(&stats);
                let task_client = client_id.clone();
                let _ = running.spawn(async move {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(client_id = %task_client, "unit of work panicked");
                    }
                    stats.finish();
                });
            }
        }
    }
    while let Some(result) = running.join_next().await {
        reap(&client_id, result);
    }
    debug!(client_id = %client_id, "executor drained");
    drained.cancel();
}

fn reap(client_id: &ClientId, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(client_id = %client_id, error = %e, "executor task failed");
        }
    }
}
