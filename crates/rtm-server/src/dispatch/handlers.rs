//! Built-in message types and authorization predicates.
//!
//! | type          | predicates                          | reply          |
//! |---------------|-------------------------------------|----------------|
//! | `ping`        | [`AllowAll`]                        | `pong`         |
//! | `whoami`      | [`AllowAll`]                        | `whoami`       |
//! | `subscribe`   | [`AllowAll`]                        | `subscribed`   |
//! | `unsubscribe` | [`AllowAll`]                        | `unsubscribed` |
//! | `publish`     | [`Authenticated`], [`HasRole`]      | `published`    |

use async_trait::async_trait;
use rtm_core::Identity;
use rtm_protocol::{Fault, ReceivedMessage};
use serde_json::{Value, json};

use super::registry::{
    AuthorizationPredicate, AuthorizerRegistry, HandlerError, HandlerRegistry, MessageHandler,
};
use super::scope::ConnectionScope;
use super::validation::require_topic;

/// Role required to publish events.
pub const PUBLISHER_ROLE: &str = "publisher";

/// Permits every message.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AuthorizationPredicate for AllowAll {
    fn test(&self, _identity: Option<&Identity>, _message: &ReceivedMessage) -> bool {
        true
    }
}

/// Requires an authenticated identity.
#[derive(Debug, Default)]
pub struct Authenticated;

impl AuthorizationPredicate for Authenticated {
    fn error_message(&self) -> String {
        "Authentication required".into()
    }

    fn test(&self, identity: Option<&Identity>, _message: &ReceivedMessage) -> bool {
        identity.is_some()
    }
}

/// Requires the identity to carry a role.
#[derive(Debug)]
pub struct HasRole {
    role: String,
}

impl HasRole {
    /// Predicate for `role`.
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl AuthorizationPredicate for HasRole {
    fn error_message(&self) -> String {
        format!("Requires role '{}'", self.role)
    }

    fn test(&self, identity: Option<&Identity>, _message: &ReceivedMessage) -> bool {
        identity.is_some_and(|i| i.has_role(&self.role))
    }
}

/// `ping` → `pong`.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let _ = scope.reply(message, "pong", json!({}));
        Ok(())
    }
}

/// Report the connection and the identity snapshot.
pub struct WhoAmIHandler;

#[async_trait]
impl MessageHandler for WhoAmIHandler {
    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let client = scope.client();
        let identity = scope.identity();
        let _ = scope.reply(
            message,
            "whoami",
            json!({
                "clientId": client.client_id,
                "kind": client.kind.as_str(),
                "connectedAt": client.connected_at.to_rfc3339(),
                "authenticated": identity.is_some(),
                "subject": identity.map(|i| i.subject.clone()),
                "roles": identity.map(|i| i.roles.iter().cloned().collect::<Vec<_>>()).unwrap_or_default(),
            }),
        );
        Ok(())
    }
}

/// Follow a topic.
pub struct SubscribeHandler;

#[async_trait]
impl MessageHandler for SubscribeHandler {
    fn validate(&self, message: &ReceivedMessage) -> Result<(), Fault> {
        require_topic(message).map(|_| ())
    }

    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let topic = require_topic(message)?;
        let added = scope.subscriptions().subscribe(topic);
        let _ = scope.reply(message, "subscribed", json!({"topic": topic, "added": added}));
        Ok(())
    }
}

/// Stop following a topic.
pub struct UnsubscribeHandler;

#[async_trait]
impl MessageHandler for UnsubscribeHandler {
    fn validate(&self, message: &ReceivedMessage) -> Result<(), Fault> {
        require_topic(message).map(|_| ())
    }

    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let topic = require_topic(message)?;
        if !scope.subscriptions().unsubscribe(topic) {
            return Err(Fault::not_found(format!("Not subscribed to '{topic}'")).into());
        }
        let _ = scope.reply(message, "unsubscribed", json!({"topic": topic}));
        Ok(())
    }
}

/// Fan an event out to every subscriber of a topic.
pub struct PublishHandler;

#[async_trait]
impl MessageHandler for PublishHandler {
    fn validate(&self, message: &ReceivedMessage) -> Result<(), Fault> {
        require_topic(message).map(|_| ())
    }

    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let topic = require_topic(message)?;
        let data = message.field("data").cloned().unwrap_or(Value::Null);
        let recipients = scope.broadcaster().publish(topic, data);
        let _ = scope.reply(
            message,
            "published",
            json!({"topic": topic, "recipients": recipients}),
        );
        Ok(())
    }
}

/// Register every built-in type with its predicates.
pub fn register_builtins(handlers: &mut HandlerRegistry, authorizers: &mut AuthorizerRegistry) {
    let _ = handlers
        .register("ping", PingHandler)
        .register("whoami", WhoAmIHandler)
        .register("subscribe", SubscribeHandler)
        .register("unsubscribe", UnsubscribeHandler)
        .register("publish", PublishHandler);

    let _ = authorizers
        .register_default::<AllowAll>("ping")
        .register_default::<AllowAll>("whoami")
        .register_default::<AllowAll>("subscribe")
        .register_default::<AllowAll>("unsubscribe")
        .register_default::<Authenticated>("publish")
        .register("publish", || HasRole::new(PUBLISHER_ROLE));
}
