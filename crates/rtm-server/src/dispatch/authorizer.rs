//! Ordered, short-circuiting authorization.

use std::sync::Arc;

use rtm_core::Identity;
use rtm_protocol::{DispatchError, ReceivedMessage};
use tracing::debug;

use super::registry::AuthorizerRegistry;

/// Evaluates a message type's predicates against the submitting identity.
pub struct Authorizer {
    registry: Arc<AuthorizerRegistry>,
}

impl Authorizer {
    /// Wrap a registry.
    pub fn new(registry: Arc<AuthorizerRegistry>) -> Self {
        Self { registry }
    }

    /// Whether any predicate is registered for the type.
    pub fn has_authorizer(&self, message_type: &str) -> bool {
        self.registry.has_authorizer(message_type)
    }

    /// Test every predicate in registration order.
    ///
    /// Stops at the first failure; later predicates are never instantiated.
    pub fn authorize(
        &self,
        message: &ReceivedMessage,
        identity: Option<&Identity>,
    ) -> Result<(), DispatchError> {
        for factory in self.registry.predicates_for(&message.message_type) {
            let predicate = factory();
            if !predicate.test(identity, message) {
                debug!(
                    predicate = predicate.name(),
                    message_type = %message.message_type,
                    "authorization rejected"
                );
                return Err(DispatchError::Unauthorized {
                    predicate: predicate.name().to_string(),
                    message: predicate.error_message(),
                });
            }
        }
        Ok(())
    }
}
