//! Shared fixtures for unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rtm_core::AuthContext;
use rtm_protocol::{CloseCode, ReceivedMessage};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::dispatch::handlers::{AllowAll, register_builtins};
use crate::dispatch::{
    AuthorizerRegistry, ConnectionScope, HandlerError, HandlerRegistry, MessageDispatcher,
    MessageHandler, ScopeSeed,
};
use crate::websocket::broadcast::{EventBroadcaster, SubscriptionManager};
use crate::websocket::broker::{BrokerConfig, BrokerDeps, ConnectionBroker};
use crate::websocket::connection::{ClientConnection, ClientContext, ConnectionKind, Outbound};
use crate::websocket::registry::ConnectionRegistry;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies `echo` with the message payload.
pub(crate) struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let _ = scope.reply(message, "echo", Value::Object(message.payload.clone()));
        Ok(())
    }
}

/// Sleeps for `ms` then replies `slow`.
pub(crate) struct Slow;

#[async_trait]
impl MessageHandler for Slow {
    async fn handle(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let ms = message.field("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let _ = scope.reply(message, "slow", json!({"ms": ms}));
        Ok(())
    }
}

pub(crate) fn addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

pub(crate) fn dispatcher() -> Arc<MessageDispatcher> {
    let mut handlers = HandlerRegistry::new();
    let mut authorizers = AuthorizerRegistry::new();
    register_builtins(&mut handlers, &mut authorizers);
    let _ = handlers.register("echo", Echo).register("slow", Slow);
    let _ = authorizers
        .register_default::<AllowAll>("echo")
        .register_default::<AllowAll>("slow");
    Arc::new(MessageDispatcher::new(handlers, authorizers))
}

pub(crate) fn deps() -> BrokerDeps {
    BrokerDeps {
        dispatcher: dispatcher(),
        registry: Arc::new(ConnectionRegistry::new()),
        broadcaster: Arc::new(EventBroadcaster::new()),
    }
}

/// A scope seed over a fresh channel.
pub(crate) fn seed() -> (ScopeSeed, mpsc::Receiver<Outbound>) {
    let client = ClientContext::new(addr(), ConnectionKind::Client);
    let (tx, rx) = mpsc::channel(64);
    let connection = Arc::new(ClientConnection::new(client.client_id.clone(), tx));
    let seed = ScopeSeed {
        client: Arc::new(client),
        connection,
        auth: Arc::new(AuthContext::new()),
        subscriptions: Arc::new(SubscriptionManager::new()),
        broadcaster: Arc::new(EventBroadcaster::new()),
    };
    (seed, rx)
}

pub(crate) struct TestBroker {
    pub(crate) broker: Arc<ConnectionBroker>,
    pub(crate) rx: mpsc::Receiver<Outbound>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) deps: BrokerDeps,
}

fn build(deps: BrokerDeps, config: BrokerConfig) -> TestBroker {
    let client = ClientContext::new(addr(), ConnectionKind::Client);
    let (tx, rx) = mpsc::channel(64);
    let connection = Arc::new(ClientConnection::new(client.client_id.clone(), tx));
    let broker = ConnectionBroker::new(
        client,
        connection,
        AuthContext::new(),
        deps.clone(),
        config,
    );
    TestBroker {
        broker,
        rx,
        registry: Arc::clone(&deps.registry),
        deps,
    }
}

/// A broker with its own registry. Must be called inside a runtime.
pub(crate) fn broker(config: BrokerConfig) -> TestBroker {
    build(deps(), config)
}

/// A broker sharing `other`'s registry, dispatcher and broadcaster.
pub(crate) fn broker_in(other: &TestBroker, config: BrokerConfig) -> TestBroker {
    build(other.deps.clone(), config)
}

/// Next text frame as JSON, skipping pings.
pub(crate) async fn recv_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
    loop {
        let item = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        match item {
            Outbound::Text(text) => return serde_json::from_str(&text).unwrap(),
            Outbound::Ping => {}
            Outbound::Close { code, reason } => panic!("unexpected close {code:?}: {reason}"),
        }
    }
}

/// Next close frame's code, skipping pings.
pub(crate) async fn recv_close(rx: &mut mpsc::Receiver<Outbound>) -> CloseCode {
    loop {
        let item = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for close")
            .expect("channel closed");
        match item {
            Outbound::Close { code, .. } => return code,
            Outbound::Ping => {}
            Outbound::Text(text) => panic!("unexpected text frame: {text}"),
        }
    }
}
