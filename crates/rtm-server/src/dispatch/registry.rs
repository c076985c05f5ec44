//! Handler and authorizer registration tables.
//!
//! Both tables are built once at startup and are read-only afterwards.
//! Registration order is preserved: handlers run, and predicates are tested,
//! in the order they were registered.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rtm_core::Identity;
use rtm_protocol::{Fault, ReceivedMessage};

use super::scope::ConnectionScope;

/// Failure raised from [`MessageHandler::handle`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A recognized business fault; reported at its declared status.
    #[error(transparent)]
    Fault(#[from] Fault),
    /// Anything else; logged and reported as an internal error.
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

/// Business logic for one message type.
///
/// Handler instances are shared across connections and messages, so any
/// state they keep must be safe for concurrent use.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Check required and well-formed fields before authorization.
    fn validate(&self, message: &ReceivedMessage) -> Result<(), Fault> {
        let _ = message;
        Ok(())
    }

    /// Process the message.
    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError>;
}

/// Authorization test for one message type.
///
/// A fresh instance is created for every authorization, so `test` must not
/// rely on state carried between calls.
pub trait AuthorizationPredicate: Send {
    /// Name reported in the unauthorized error.
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Message reported to the client when the test fails.
    fn error_message(&self) -> String {
        "Not authorized".to_string()
    }

    /// Whether `identity` may send `message`.
    fn test(&self, identity: Option<&Identity>, message: &ReceivedMessage) -> bool;
}

/// Creates a predicate instance per authorization.
pub type PredicateFactory = Arc<dyn Fn() -> Box<dyn AuthorizationPredicate> + Send + Sync>;

/// Message type → ordered handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for a message type.
    pub fn register(
        &mut self,
        message_type: &str,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.register_shared(message_type, Arc::new(handler))
    }

    /// Append an already-shared handler for a message type.
    pub fn register_shared(
        &mut self,
        message_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> &mut Self {
        self.handlers
            .entry(message_type.to_owned())
            .or_default()
            .push(handler);
        self
    }

    /// Handlers for a type, in registration order. Empty if none.
    pub fn handlers_for(&self, message_type: &str) -> &[Arc<dyn MessageHandler>] {
        self.handlers.get(message_type).map_or(&[], Vec::as_slice)
    }

    /// Whether at least one handler is registered for the type.
    pub fn has_handler(&self, message_type: &str) -> bool {
        !self.handlers_for(message_type).is_empty()
    }

    /// Registered message types (sorted).
    pub fn message_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Message type → ordered predicate factories.
#[derive(Default)]
pub struct AuthorizerRegistry {
    predicates: HashMap<String, Vec<PredicateFactory>>,
}

impl AuthorizerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a predicate for a message type.
    pub fn register<P, F>(&mut self, message_type: &str, factory: F) -> &mut Self
    where
        P: AuthorizationPredicate + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let boxed: PredicateFactory =
            Arc::new(move || -> Box<dyn AuthorizationPredicate> { Box::new(factory()) });
        self.predicates
            .entry(message_type.to_owned())
            .or_default()
            .push(boxed);
        self
    }

    /// Append a predicate built with `Default`.
    pub fn register_default<P>(&mut self, message_type: &str) -> &mut Self
    where
        P: AuthorizationPredicate + Default + 'static,
    {
        self.register(message_type, P::default)
    }

    /// Predicate factories for a type, in registration order.
    pub fn predicates_for(&self, message_type: &str) -> &[PredicateFactory] {
        self.predicates.get(message_type).map_or(&[], Vec::as_slice)
    }

    /// Whether at least one predicate is registered for the type.
    pub fn has_authorizer(&self, message_type: &str) -> bool {
        !self.predicates_for(message_type).is_empty()
    }

    /// Registered message types (sorted).
    pub fn message_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.predicates.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registration table mismatch found at startup.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error(
    "incomplete registration table (no authorizer: {missing_authorizer:?}, no handler: {missing_handler:?})"
)]
pub struct RegistryMismatch {
    /// Types with handlers but no authorizer.
    pub missing_authorizer: Vec<String>,
    /// Types with authorizers but no handler.
    pub missing_handler: Vec<String>,
}

/// Check that every type has both a handler and an authorizer.
pub fn verify(
    handlers: &HandlerRegistry,
    authorizers: &AuthorizerRegistry,
) -> Result<(), RegistryMismatch> {
    let handled: BTreeSet<String> = handlers.message_types().into_iter().collect();
    let authorized: BTreeSet<String> = authorizers.message_types().into_iter().collect();

    let missing_authorizer: Vec<String> = handled.difference(&authorized).cloned().collect();
    let missing_handler: Vec<String> = authorized.difference(&handled).cloned().collect();

    if missing_authorizer.is_empty() && missing_handler.is_empty() {
        Ok(())
    } else {
        Err(RegistryMismatch {
            missing_authorizer,
            missing_handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(
            &self,
            _scope: &ConnectionScope,
            _message: &ReceivedMessage,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct IsEnrolled;

    impl AuthorizationPredicate for IsEnrolled {
        fn test(&self, identity: Option<&Identity>, _message: &ReceivedMessage) -> bool {
            identity.is_some()
        }
    }

    #[test]
    fn empty_registry() {
        let reg = HandlerRegistry::new();
        assert!(!reg.has_handler("ping"));
        assert!(reg.handlers_for("ping").is_empty());
        assert!(reg.message_types().is_empty());
    }

    #[test]
    fn handlers_accumulate_in_order() {
        let mut reg = HandlerRegistry::new();
        let _ = reg.register("ping", Noop).register("ping", Noop);
        let _ = reg.register("echo", Noop);
        assert_eq!(reg.handlers_for("ping").len(), 2);
        assert_eq!(reg.message_types(), vec!["echo", "ping"]);
    }

    #[test]
    fn authorizer_factories_create_fresh_instances() {
        let mut reg = AuthorizerRegistry::new();
        let _ = reg.register_default::<IsEnrolled>("grades.view");
        let factories = reg.predicates_for("grades.view");
        assert_eq!(factories.len(), 1);
        let predicate = factories[0]();
        assert_eq!(predicate.name(), "IsEnrolled");
        assert_eq!(predicate.error_message(), "Not authorized");
    }

    #[test]
    fn verify_complete_table() {
        let mut handlers = HandlerRegistry::new();
        let mut authorizers = AuthorizerRegistry::new();
        let _ = handlers.register("ping", Noop);
        let _ = authorizers.register_default::<IsEnrolled>("ping");
        assert!(verify(&handlers, &authorizers).is_ok());
    }

    #[test]
    fn verify_reports_both_directions() {
        let mut handlers = HandlerRegistry::new();
        let mut authorizers = AuthorizerRegistry::new();
        let _ = handlers.register("a", Noop).register("b", Noop);
        let _ = authorizers
            .register_default::<IsEnrolled>("b")
            .register_default::<IsEnrolled>("c");

        let err = verify(&handlers, &authorizers).unwrap_err();
        assert_eq!(err.missing_authorizer, vec!["a"]);
        assert_eq!(err.missing_handler, vec!["c"]);
        assert!(err.to_string().contains("incomplete"));
    }
}
