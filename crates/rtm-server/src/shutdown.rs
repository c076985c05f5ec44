//! Process shutdown: OS signals and the HTTP listener tasks that stop
//! accepting once every connection has been closed.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stops the listener tasks spawned by [`RtmServer::listen`](crate::server::RtmServer::listen).
///
/// Listeners watch [`token`](Self::token) and are tracked here so the
/// server can wait for them after its connections are gone.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// No listeners, not stopped.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Token a listener awaits before it stops accepting.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Track a listener task. A listener tracked after the stop is aborted.
    pub fn track(&self, handle: JoinHandle<()>) {
        if self.token.is_cancelled() {
            handle.abort();
            return;
        }
        self.listeners.lock().push(handle);
    }

    /// Listeners currently tracked.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether the listeners have been told to stop.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for every tracked listener.
    ///
    /// Listeners still running at the timeout are aborted. Returns whether
    /// all of them stopped on their own. Later calls find nothing to wait for.
    pub async fn stop_listeners(&self, timeout: Duration) -> bool {
        self.token.cancel();
        let handles = std::mem::take(&mut *self.listeners.lock());
        if handles.is_empty() {
            debug!("no listeners to stop");
            return true;
        }
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        info!(
            listeners = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "stopping listeners"
        );

        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok()
        {
            return true;
        }
        warn!("listeners still running after {timeout:?}, aborting");
        for abort in aborts {
            abort.abort();
        }
        false
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on ctrl-c, or on SIGTERM where supported.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => info!("received SIGTERM"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
