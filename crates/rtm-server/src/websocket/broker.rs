//! Per-connection lifecycle: handshake, inbound frames, flow control and the
//! close and graceful-shutdown sequences.
//!
//! ```text
//! CONNECTING ──▶ OPEN ──▶ CLOSING ──▶ CLOSED
//!     │                                 ▲
//!     └──── refused (shutdown/limit) ───┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use rtm_core::{AuthContext, ClientId};
use rtm_protocol::{CloseCode, FlowControlMode, OutboundEnvelope, ReceivedMessage, status};
use tracing::{debug, info, warn};

use super::broadcast::{EventBroadcaster, SubscriptionManager};
use super::connection::{ClientConnection, ClientContext};
use super::executor::ConnectionExecutor;
use super::registry::ConnectionRegistry;
use crate::config::ServerConfig;
use crate::dispatch::{MessageDispatcher, ScopeSeed};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_REFUSED_TOTAL, CONNECTIONS_TOTAL, MESSAGES_TOTAL,
    WAIT_PENDING_TIMEOUTS_TOTAL,
};

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BrokerState {
    /// Handshake accepted, not yet admitted.
    Connecting = 0,
    /// Admitted; frames are processed.
    Open = 1,
    /// Close sequence running.
    Closing = 2,
    /// Fully closed or refused.
    Closed = 3,
}

impl BrokerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection was not admitted.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Process-wide shutdown has started.
    #[error("server is shutting down")]
    ShuttingDown,
    /// `max_connections` reached.
    #[error("connection limit reached ({0})")]
    LimitReached(usize),
    /// The `hello` envelope could not be queued.
    #[error("failed to send hello")]
    HelloFailed,
}

impl ConnectError {
    fn label(&self) -> &'static str {
        match self {
            Self::ShuttingDown => "shutting_down",
            Self::LimitReached(_) => "limit",
            Self::HelloFailed => "hello_failed",
        }
    }
}

/// Result of a graceful shutdown request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All work finished within the timeout.
    Drained,
    /// Work was still running at the timeout and was discarded.
    Forced,
    /// The connection was already closing or never opened.
    AlreadyClosing,
}

/// Per-connection tuning.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Worker pool size.
    pub max_workers: usize,
    /// Admission limit across the process.
    pub max_connections: usize,
    /// Drain budget when the connection closes on its own.
    pub close_drain_timeout: Duration,
    /// `WAIT_PENDING` wait when the message omits one.
    pub default_wait: Duration,
    /// Upper bound for client-requested waits.
    pub max_wait: Duration,
}

impl From<&ServerConfig> for BrokerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            max_connections: config.max_connections,
            close_drain_timeout: config.close_drain_timeout,
            default_wait: config.default_wait,
            max_wait: config.max_wait,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Process-wide collaborators shared by every broker.
#[derive(Clone)]
pub struct BrokerDeps {
    /// Validate/authorize/dispatch pipeline.
    pub dispatcher: Arc<MessageDispatcher>,
    /// Live connection set.
    pub registry: Arc<ConnectionRegistry>,
    /// Topic fan-out.
    pub broadcaster: Arc<EventBroadcaster>,
}

/// Owns one connection: its executor, identity slot and scope seed.
pub struct ConnectionBroker {
    seed: ScopeSeed,
    executor: ConnectionExecutor,
    dispatcher: Arc<MessageDispatcher>,
    registry: Arc<ConnectionRegistry>,
    config: BrokerConfig,
    state: AtomicU8,
    shutdown_started: AtomicBool,
    registered: AtomicBool,
}

impl ConnectionBroker {
    /// Build a broker in the `Connecting` state. Must be called inside a
    /// Tokio runtime (the executor starts immediately).
    pub fn new(
        client: ClientContext,
        connection: Arc<ClientConnection>,
        auth: AuthContext,
        deps: BrokerDeps,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let executor = ConnectionExecutor::new(client.client_id.clone(), config.max_workers);
        let seed = ScopeSeed {
            client: Arc::new(client),
            connection,
            auth: Arc::new(auth),
            subscriptions: Arc::new(SubscriptionManager::new()),
            broadcaster: deps.broadcaster,
        };
        Arc::new(Self {
            seed,
            executor,
            dispatcher: deps.dispatcher,
            registry: deps.registry,
            config,
            state: AtomicU8::new(BrokerState::Connecting as u8),
            shutdown_started: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        })
    }

    /// Connection id.
    pub fn client_id(&self) -> &ClientId {
        &self.seed.client.client_id
    }

    /// Handshake facts.
    pub fn context(&self) -> &ClientContext {
        &self.seed.client
    }

    /// Send side of the socket.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.seed.connection
    }

    /// Identity slot.
    pub fn auth(&self) -> &AuthContext {
        &self.seed.auth
    }

    /// Topics this connection follows.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.seed.subscriptions
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BrokerState {
        BrokerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queued plus running units of work.
    pub fn pending_task_count(&self) -> usize {
        self.executor.pending_task_count()
    }

    fn set_state(&self, state: BrokerState) -> BrokerState {
        BrokerState::from_u8(self.state.swap(state as u8, Ordering::SeqCst))
    }

    /// Admit the connection: register it and send `hello`.
    ///
    /// Refused connections are closed with `going away` (shutdown) or
    /// `policy violation` (limit) and end in `Closed`. The limit and the
    /// shutdown flag are checked again after registering, so a concurrent
    /// upgrade cannot overshoot `max_connections` and a concurrent
    /// `close_all_connections` either refuses or shuts down this connection.
    pub fn initialise(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.registry.is_shutting_down() {
            return self.refuse(
                CloseCode::GoingAway,
                "Server is shutting down",
                ConnectError::ShuttingDown,
            );
        }
        let limit = self.config.max_connections;
        if self.registry.len() >= limit {
            return self.refuse(
                CloseCode::PolicyViolation,
                "Connection limit reached",
                ConnectError::LimitReached(limit),
            );
        }

        self.registry.register(Arc::clone(self));
        if self.registry.len() > limit {
            let _ = self.registry.deregister(self.client_id());
            return self.refuse(
                CloseCode::PolicyViolation,
                "Connection limit reached",
                ConnectError::LimitReached(limit),
            );
        }
        let _ = self.set_state(BrokerState::Open);
        if self.registry.is_shutting_down() {
            if self.shutdown_started.swap(true, Ordering::SeqCst) {
                // Claimed by close_all_connections, which owns the close.
                return Err(ConnectError::ShuttingDown);
            }
            let _ = self.registry.deregister(self.client_id());
            return self.refuse(
                CloseCode::GoingAway,
                "Server is shutting down",
                ConnectError::ShuttingDown,
            );
        }
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(ConnectError::ShuttingDown);
        }
        self.registered.store(true, Ordering::Release);
        self.seed.broadcaster.add(
            Arc::clone(&self.seed.connection),
            Arc::clone(&self.seed.subscriptions),
        );
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);

        let hello = OutboundEnvelope::Hello {
            client_id: self.client_id().to_string(),
        };
        if !self.seed.connection.send_envelope(&hello) {
            warn!(client_id = %self.client_id(), "failed to send hello, disconnecting");
            self.seed.connection.disconnect();
            return Err(ConnectError::HelloFailed);
        }

        info!(
            client_id = %self.client_id(),
            remote_addr = %self.seed.client.remote_addr,
            kind = %self.seed.client.kind,
            authenticated = self.seed.auth.is_authenticated(),
            max_workers = self.executor.max_workers(),
            "client connected"
        );
        Ok(())
    }

    fn refuse(
        &self,
        code: CloseCode,
        reason: &str,
        error: ConnectError,
    ) -> Result<(), ConnectError> {
        warn!(client_id = %self.client_id(), reason, "refusing connection");
        counter!(CONNECTIONS_REFUSED_TOTAL, "reason" => error.label()).increment(1);
        let _ = self.set_state(BrokerState::Closed);
        let _ = self.seed.connection.close(code, reason);
        Err(error)
    }

    /// Handle one inbound text frame.
    ///
    /// Blocks the caller only for `WAIT_PENDING`, and at most for the
    /// clamped wait.
    pub async fn on_text(&self, text: &str) {
        if self.registry.is_shutting_down()
            || self.shutdown_started.load(Ordering::Acquire)
            || self.state() != BrokerState::Open
        {
            debug!(client_id = %self.client_id(), "dropping frame, connection is shutting down");
            return;
        }

        let message = match ReceivedMessage::decode(text) {
            Ok(message) => message,
            Err((reply_to, error)) => {
                debug!(client_id = %self.client_id(), error = %error, "malformed message");
                let _ = self
                    .seed
                    .connection
                    .send_envelope(&error.to_envelope(reply_to));
                return;
            }
        };
        counter!(MESSAGES_TOTAL, "mode" => mode_label(message.mode)).increment(1);

        if message.mode == FlowControlMode::WaitPending {
            self.wait_for_pending(&message).await;
        }

        let scope = self.seed.scope_for(&message);
        let dispatcher = Arc::clone(&self.dispatcher);
        if let Err(e) = self
            .executor
            .execute(async move { dispatcher.dispatch(scope, message).await })
        {
            debug!(error = %e, "executor rejected unit of work");
        }
    }

    async fn wait_for_pending(&self, message: &ReceivedMessage) {
        let pending = self.executor.pending_task_count();
        if pending == 0 {
            return;
        }
        let wait = message.wait_duration(self.config.default_wait, self.config.max_wait);
        debug!(
            client_id = %self.client_id(),
            message_id = %message.id,
            pending,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "waiting for pending work"
        );
        if !self.executor.wait_for_pending(wait).await {
            debug!(client_id = %self.client_id(), message_id = %message.id, "wait elapsed, proceeding");
            counter!(WAIT_PENDING_TIMEOUTS_TOTAL).increment(1);
        }
    }

    /// Binary frames are not part of the protocol. The connection stays open.
    pub fn on_binary(&self, len: usize) {
        debug!(client_id = %self.client_id(), len, "rejecting binary frame");
        let _ = self.seed.connection.send_envelope(&OutboundEnvelope::error(
            None,
            status::UNSUPPORTED_MESSAGE_TYPE,
            "Unsupported message type",
        ));
    }

    /// Report a transport failure before the transport closes the socket.
    pub fn on_transport_error(&self, error: &dyn std::fmt::Display) {
        warn!(client_id = %self.client_id(), error = %error, "transport error");
        let _ = self.seed.connection.send_envelope(&OutboundEnvelope::error(
            None,
            status::BAD_REQUEST,
            format!("Transport error: {error}"),
        ));
    }

    /// Close sequence: stop dispatch, release state, deregister, then drain
    /// the executor (bounded) and force-stop anything left.
    ///
    /// Runs at most once; refused connections skip it.
    pub async fn on_close(&self) {
        let previous = self.set_state(BrokerState::Closing);
        if matches!(previous, BrokerState::Closing | BrokerState::Closed) {
            let _ = self.set_state(previous);
            return;
        }

        self.seed.connection.begin_close();
        self.dispatcher.cleanup(&self.seed);
        let _ = self.registry.deregister(self.client_id());
        if self.registered.swap(false, Ordering::AcqRel) {
            gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        }

        let drained = self.executor.shutdown(self.config.close_drain_timeout).await;
        let _ = self.set_state(BrokerState::Closed);
        info!(
            client_id = %self.client_id(),
            drained,
            dropped_messages = self.seed.connection.drop_count(),
            age_secs = self.seed.connection.age().as_secs(),
            "client disconnected"
        );
    }

    /// Notify → bounded drain → close with `going away`.
    ///
    /// Frames arriving after the notice are dropped. Runs at most once.
    pub async fn graceful_shutdown(&self, timeout: Duration, reason: &str) -> ShutdownOutcome {
        let eligible = matches!(self.state(), BrokerState::Connecting | BrokerState::Open);
        if !eligible || self.shutdown_started.swap(true, Ordering::SeqCst) {
            return ShutdownOutcome::AlreadyClosing;
        }
        debug!(
            client_id = %self.client_id(),
            pending = self.executor.pending_task_count(),
            "draining connection for shutdown"
        );
        let _ = self
            .seed
            .connection
            .send_envelope(&OutboundEnvelope::Shutdown {
                message: reason.to_owned(),
            });

        let drained = self.executor.shutdown_coordinated(timeout).await;
        if !drained {
            let undrained = self.executor.force_stop();
            warn!(
                client_id = %self.client_id(),
                undrained,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "connection did not drain before shutdown timeout, forcing close"
            );
        }
        let _ = self.seed.connection.close(CloseCode::GoingAway, reason);
        if drained {
            ShutdownOutcome::Drained
        } else {
            ShutdownOutcome::Forced
        }
    }
}

fn mode_label(mode: FlowControlMode) -> &'static str {
    match mode {
        FlowControlMode::Default => "default",
        FlowControlMode::WaitPending => "wait_pending",
    }
}
