//! Per-message connection scope and request context.
//!
//! A [`ScopeSeed`] holds a connection's long-lived singletons. For every
//! inbound message the broker derives a fresh [`ConnectionScope`] from it,
//! snapshotting the identity at submission time. The scope travels with the
//! unit of work and is dropped when dispatch finishes.

use std::sync::Arc;

use rtm_core::{AuthContext, ClientId, Identity, TraceId};
use rtm_protocol::{DispatchError, ReceivedMessage, reply};
use serde_json::Value;
use tracing::Span;

use crate::websocket::broadcast::{EventBroadcaster, SubscriptionManager};
use crate::websocket::connection::{ClientConnection, ClientContext};

/// Connection-wide singletons every scope is seeded with.
#[derive(Clone)]
pub struct ScopeSeed {
    /// Immutable handshake facts.
    pub client: Arc<ClientContext>,
    /// Send side of the socket.
    pub connection: Arc<ClientConnection>,
    /// Mutable identity slot.
    pub auth: Arc<AuthContext>,
    /// Topics this connection follows.
    pub subscriptions: Arc<SubscriptionManager>,
    /// Process-wide topic fan-out.
    pub broadcaster: Arc<EventBroadcaster>,
}

impl ScopeSeed {
    /// Derive the scope for one message.
    pub fn scope_for(&self, message: &ReceivedMessage) -> ConnectionScope {
        let identity = self.auth.current();
        let trace_id = message
            .trace_id
            .clone()
            .filter(|t| !t.is_empty())
            .map_or_else(TraceId::new, TraceId::from);
        let request = RequestContext {
            client_id: self.client.client_id.clone(),
            message_type: message.message_type.clone(),
            message_id: message.id.clone(),
            trace_id,
            identity: identity.clone(),
        };
        ConnectionScope {
            seed: self.clone(),
            identity,
            request,
        }
    }
}

/// Diagnostic context bound to one dispatch.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Owning connection.
    pub client_id: ClientId,
    /// Inbound message type.
    pub message_type: String,
    /// Inbound message id.
    pub message_id: String,
    /// Client-supplied or generated trace id.
    pub trace_id: TraceId,
    /// Identity snapshot.
    pub identity: Option<Arc<Identity>>,
}

impl RequestContext {
    /// Span every log line emitted during this dispatch is attached to.
    pub fn span(&self) -> Span {
        let span = tracing::info_span!(
            "rtm.dispatch",
            client_id = %self.client_id,
            message_type = %self.message_type,
            message_id = %self.message_id,
            trace_id = %self.trace_id,
            identity = tracing::field::Empty,
        );
        if let Some(identity) = &self.identity {
            let _ = span.record("identity", identity.subject.as_str());
        }
        span
    }
}

/// Everything a handler can reach while processing one message.
pub struct ConnectionScope {
    seed: ScopeSeed,
    identity: Option<Arc<Identity>>,
    request: RequestContext,
}

impl ConnectionScope {
    /// Handshake facts.
    pub fn client(&self) -> &ClientContext {
        &self.seed.client
    }

    /// Send side of the socket.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.seed.connection
    }

    /// Identity captured when the message was submitted.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_deref()
    }

    /// The connection's identity slot. Changes apply to later messages only.
    pub fn auth(&self) -> &AuthContext {
        &self.seed.auth
    }

    /// Topics this connection follows.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.seed.subscriptions
    }

    /// Process-wide topic fan-out.
    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.seed.broadcaster
    }

    /// Diagnostic context.
    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    /// Send `{"type": reply_type, "replyTo": message.id, ...body}`.
    pub fn reply(&self, message: &ReceivedMessage, reply_type: &str, body: Value) -> bool {
        self.seed
            .connection
            .send_json(&reply(reply_type, &message.id, body))
    }

    /// Send an error envelope correlated to `message`.
    pub fn send_error(&self, message: &ReceivedMessage, error: &DispatchError) -> bool {
        self.seed
            .connection
            .send_envelope(&error.to_envelope(Some(message.id.clone())))
    }
}
