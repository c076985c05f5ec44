//! Topic subscriptions and event fan-out to connected clients.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rtm_core::ClientId;
use rtm_protocol::OutboundEnvelope;
use serde_json::Value;
use tracing::{debug, warn};

use super::connection::ClientConnection;

/// Topics one connection follows.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    topics: RwLock<BTreeSet<String>>,
}

impl SubscriptionManager {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow a topic. Returns `false` if already subscribed.
    pub fn subscribe(&self, topic: &str) -> bool {
        self.topics.write().insert(topic.to_owned())
    }

    /// Stop following a topic. Returns `false` if not subscribed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.topics.write().remove(topic)
    }

    /// Whether the topic is followed.
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    /// Followed topics (sorted).
    pub fn topics(&self) -> Vec<String> {
        self.topics.read().iter().cloned().collect()
    }

    /// Drop every subscription. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut topics = self.topics.write();
        let removed = topics.len();
        topics.clear();
        removed
    }
}

struct Member {
    connection: Arc<ClientConnection>,
    subscriptions: Arc<SubscriptionManager>,
}

/// Process-wide fan-out of server envelopes to live connections.
#[derive(Default)]
pub struct EventBroadcaster {
    members: DashMap<ClientId, Member>,
}

impl EventBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub fn add(&self, connection: Arc<ClientConnection>, subscriptions: Arc<SubscriptionManager>) {
        let _ = self.members.insert(
            connection.client_id().clone(),
            Member {
                connection,
                subscriptions,
            },
        );
    }

    /// Remove a connection by id.
    pub fn remove(&self, client_id: &ClientId) {
        let _ = self.members.remove(client_id);
    }

    /// Send an `event` envelope to every connection subscribed to `topic`.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn publish(&self, topic: &str, data: Value) -> usize {
        let envelope = OutboundEnvelope::Event {
            topic: topic.to_owned(),
            data,
        };
        let Some(json) = serialize(&envelope) else {
            return 0;
        };
        let mut delivered = 0;
        for member in &self.members {
            if !member.subscriptions.contains(topic) {
                continue;
            }
            if member.connection.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                warn!(client_id = %member.key(), topic, "failed to send event to client");
            }
        }
        debug!(topic, recipients = delivered, "published event");
        delivered
    }

    /// Send an envelope to every connection.
    pub fn broadcast_all(&self, envelope: &OutboundEnvelope) -> usize {
        let Some(json) = serialize(envelope) else {
            return 0;
        };
        let mut delivered = 0;
        for member in &self.members {
            if member.connection.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                warn!(client_id = %member.key(), "failed to send envelope to client");
            }
        }
        debug!(recipients = delivered, "broadcast envelope to all");
        delivered
    }

    /// Number of connections following `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.members
            .iter()
            .filter(|m| m.subscriptions.contains(topic))
            .count()
    }

    /// Number of connections.
    pub fn connection_count(&self) -> usize {
        self.members.len()
    }
}

fn serialize(envelope: &OutboundEnvelope) -> Option<Arc<String>> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize envelope");
            None
        }
    }
}
