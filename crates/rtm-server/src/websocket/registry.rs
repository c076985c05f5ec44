//! Process-wide set of live connections and coordinated shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rtm_core::ClientId;
use tracing::{debug, info, warn};

use super::broker::{ConnectionBroker, ShutdownOutcome};

/// Summary of a [`ConnectionRegistry::close_all_connections`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that drained within the timeout.
    pub drained: usize,
    /// Connections force-closed at the timeout.
    pub forced: usize,
    /// Connections already closing when the call started.
    pub skipped: usize,
}

impl ShutdownReport {
    /// Connections the call acted on.
    pub fn total(&self) -> usize {
        self.drained + self.forced + self.skipped
    }
}

/// Live connections keyed by client id, plus the set-once shutdown flag.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<ConnectionBroker>>,
    shutting_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Re-registering the same id replaces the entry.
    pub fn register(&self, broker: Arc<ConnectionBroker>) {
        let id = broker.client_id().clone();
        debug!(client_id = %id, "registered connection");
        let _ = self.connections.insert(id, broker);
    }

    /// Remove a connection. Returns whether it was present.
    pub fn deregister(&self, client_id: &ClientId) -> bool {
        let removed = self.connections.remove(client_id).is_some();
        if removed {
            debug!(client_id = %client_id, "deregistered connection");
        }
        removed
    }

    /// Whether a connection is registered.
    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.connections.contains_key(client_id)
    }

    /// Look up a connection.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ConnectionBroker>> {
        self.connections.get(client_id).map(|e| Arc::clone(e.value()))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of every live connection.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionBroker>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Whether process-wide shutdown has started. Never resets.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Set the shutdown flag, then gracefully shut down every registered
    /// connection concurrently, each bounded by `timeout`.
    ///
    /// Never fails. Connections that do not drain in time are force-closed
    /// and logged by their broker.
    pub async fn close_all_connections(&self, timeout: Duration, reason: &str) -> ShutdownReport {
        let first = !self.shutting_down.swap(true, Ordering::SeqCst);
        let brokers = self.snapshot();
        if first {
            info!(
                connections = brokers.len(),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "shutting down all connections"
            );
        } else {
            debug!(connections = brokers.len(), "shutdown already in progress");
        }

        let outcomes = futures::future::join_all(
            brokers
                .iter()
                .map(|broker| broker.graceful_shutdown(timeout, reason)),
        )
        .await;

        let mut report = ShutdownReport::default();
        for outcome in outcomes {
            match outcome {
                ShutdownOutcome::Drained => report.drained += 1,
                ShutdownOutcome::Forced => report.forced += 1,
                ShutdownOutcome::AlreadyClosing => report.skipped += 1,
            }
        }
        if report.forced > 0 {
            warn!(forced = report.forced, drained = report.drained, "some connections were force-closed");
        } else if first {
            info!(drained = report.drained, "all connections drained");
        }
        report
    }
}
