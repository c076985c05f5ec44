//! `WebSocket` client connection state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rtm_core::ClientId;
use rtm_protocol::{CloseCode, OutboundEnvelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which endpoint a connection arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Regular client endpoint (`/rtm`).
    Client,
    /// Administrative endpoint (`/rtm/admin`).
    Admin,
}

impl ConnectionKind {
    /// Stable label used in logs and replies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable facts about a connection, fixed at the handshake.
#[derive(Clone, Debug)]
pub struct ClientContext {
    /// Generated connection id.
    pub client_id: ClientId,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// Endpoint the connection arrived on.
    pub kind: ConnectionKind,
    /// Wall-clock time of the handshake.
    pub connected_at: DateTime<Utc>,
}

impl ClientContext {
    /// Context for a freshly accepted connection.
    pub fn new(remote_addr: SocketAddr, kind: ConnectionKind) -> Self {
        Self {
            client_id: ClientId::new(),
            remote_addr,
            kind,
            connected_at: Utc::now(),
        }
    }
}

/// Items consumed by the connection's write task.
#[derive(Debug)]
pub enum Outbound {
    /// A text frame.
    Text(Arc<String>),
    /// A heartbeat ping.
    Ping,
    /// A close frame; the writer stops after sending it.
    Close {
        /// Close code.
        code: CloseCode,
        /// Close reason.
        reason: String,
    },
}

/// Send side of a connected `WebSocket` client.
///
/// Every outbound frame goes through a bounded channel drained by the write
/// task, so sends never block the caller.
pub struct ClientConnection {
    client_id: ClientId,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
    close_requested: AtomicBool,
    closing: AtomicBool,
    disconnect: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection handle.
    pub fn new(client_id: ClientId, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            close_requested: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            disconnect: CancellationToken::new(),
        }
    }

    /// Connection id.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(Outbound::Text(message)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize a JSON value and queue it.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Serialize a server envelope and queue it.
    pub fn send_envelope(&self, envelope: &OutboundEnvelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Queue a heartbeat ping.
    pub fn ping(&self) -> bool {
        self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// Queue a close frame behind any frames already queued.
    ///
    /// Only the first call has an effect. If the frame cannot be queued the
    /// connection is disconnected outright.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> bool {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        let frame = Outbound::Close {
            code,
            reason: reason.into(),
        };
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            self.disconnect();
            false
        }
    }

    /// Whether a close frame has been requested.
    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Drop the transport without a close handshake.
    pub fn disconnect(&self) {
        self.disconnect.cancel();
    }

    /// Whether [`disconnect`](Self::disconnect) has been called.
    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_cancelled()
    }

    /// Resolves once the connection is hard-disconnected.
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await;
    }

    /// Mark the start of the close sequence. No dispatch begins afterwards.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Whether the close sequence has started.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Duration since the last inbound frame (or connection establishment).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
