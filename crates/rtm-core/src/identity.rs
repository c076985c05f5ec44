//! Authenticated identity and the per-connection authentication slot.
//!
//! A connection owns exactly one [`AuthContext`]. Work submitted to the
//! connection's executor never reads the slot directly: the broker snapshots
//! the current identity at submission time and threads the immutable
//! `Arc<Identity>` through dispatch. Mutations made by a handler (login,
//! logout) therefore only affect messages submitted afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// An authenticated principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (user id).
    pub subject: String,
    /// Roles granted to the subject.
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Identity {
    /// Create an identity with no roles.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: BTreeSet::new(),
        }
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let _ = self.roles.insert(role.into());
        self
    }

    /// Whether the identity carries `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Mutable, connection-scoped identity slot.
#[derive(Debug, Default)]
pub struct AuthContext {
    identity: RwLock<Option<Arc<Identity>>>,
}

impl AuthContext {
    /// Create an empty (anonymous) slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot already holding `identity`.
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: RwLock::new(Some(Arc::new(identity))),
        }
    }

    /// Replace the current identity.
    pub fn install(&self, identity: Identity) {
        *self.identity.write() = Some(Arc::new(identity));
    }

    /// Snapshot of the current identity.
    pub fn current(&self) -> Option<Arc<Identity>> {
        self.identity.read().clone()
    }

    /// Drop the current identity.
    pub fn clear(&self) {
        *self.identity.write() = None;
    }

    /// Whether an identity is installed.
    pub fn is_authenticated(&self) -> bool {
        self.identity.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_slot_is_anonymous() {
        let ctx = AuthContext::new();
        assert!(!ctx.is_authenticated());
        assert!(ctx.current().is_none());
    }

    #[test]
    fn install_and_clear() {
        let ctx = AuthContext::new();
        ctx.install(Identity::new("alice"));
        assert_eq!(ctx.current().unwrap().subject, "alice");
        ctx.clear();
        assert!(ctx.current().is_none());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_install() {
        let ctx = AuthContext::with_identity(Identity::new("alice"));
        let snapshot = ctx.current();
        ctx.install(Identity::new("bob"));
        assert_eq!(snapshot.unwrap().subject, "alice");
        assert_eq!(ctx.current().unwrap().subject, "bob");
    }

    #[test]
    fn roles() {
        let id = Identity::new("alice").with_role("instructor");
        assert!(id.has_role("instructor"));
        assert!(!id.has_role("admin"));
    }

    #[test]
    fn identity_deserializes_without_roles() {
        let id: Identity = serde_json::from_str(r#"{"subject":"u1"}"#).unwrap();
        assert_eq!(id.subject, "u1");
        assert!(id.roles.is_empty());
    }
}
