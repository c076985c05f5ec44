//! Validate → authorize → handle, with a single error boundary.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use rtm_core::Identity;
use rtm_protocol::{DispatchError, ReceivedMessage};
use tracing::{Instrument, debug, error, warn};

use super::authorizer::Authorizer;
use super::registry::{AuthorizerRegistry, HandlerError, HandlerRegistry};
use super::scope::{ConnectionScope, ScopeSeed};
use crate::metrics::{DISPATCH_DURATION_SECONDS, DISPATCH_ERRORS_TOTAL};

/// Routes decoded messages to their registered handlers.
pub struct MessageDispatcher {
    handlers: Arc<HandlerRegistry>,
    authorizer: Authorizer,
}

impl MessageDispatcher {
    /// Build a dispatcher over the startup registration tables.
    pub fn new(handlers: HandlerRegistry, authorizers: AuthorizerRegistry) -> Self {
        Self {
            handlers: Arc::new(handlers),
            authorizer: Authorizer::new(Arc::new(authorizers)),
        }
    }

    /// The handler table.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Default checks (handler and authorizer present), then each handler's
    /// own validation in registration order.
    pub fn validate(&self, message: &ReceivedMessage) -> Result<(), DispatchError> {
        let message_type = &message.message_type;
        let handlers = self.handlers.handlers_for(message_type);
        if handlers.is_empty() {
            return Err(DispatchError::Configuration {
                message: format!("No handler registered for message type '{message_type}'"),
            });
        }
        if !self.authorizer.has_authorizer(message_type) {
            return Err(DispatchError::Configuration {
                message: format!("No authorizer registered for message type '{message_type}'"),
            });
        }
        for handler in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler.validate(message))) {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => return Err(DispatchError::from_validation(fault)),
                Err(_) => {
                    return Err(DispatchError::Unhandled {
                        message: format!("Unhandled validation error for '{message_type}'"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Test the type's predicates against `identity`.
    pub fn authorize(
        &self,
        message: &ReceivedMessage,
        identity: Option<&Identity>,
    ) -> Result<(), DispatchError> {
        self.authorizer.authorize(message, identity)
    }

    /// Run every handler in registration order, stopping at the first failure.
    async fn run_handlers(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), DispatchError> {
        for handler in self.handlers.handlers_for(&message.message_type) {
            match AssertUnwindSafe(handler.handle(scope, message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(HandlerError::Fault(fault))) => return Err(fault.into()),
                Ok(Err(HandlerError::Unhandled(e))) => {
                    return Err(DispatchError::Unhandled {
                        message: format!("{e:#}"),
                    });
                }
                Err(panic) => {
                    return Err(DispatchError::Unhandled {
                        message: panic_message(panic.as_ref()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate, authorize and handle one message.
    pub async fn process(
        &self,
        scope: &ConnectionScope,
        message: &ReceivedMessage,
    ) -> Result<(), DispatchError> {
        self.validate(message)?;
        self.authorize(message, scope.identity())?;
        self.run_handlers(scope, message).await
    }

    /// Entry point for one unit of work.
    ///
    /// Every failure becomes exactly one `error` envelope correlated to the
    /// message id. Nothing propagates to the executor.
    pub async fn dispatch(&self, scope: ConnectionScope, message: ReceivedMessage) {
        let span = scope.request().span();
        async move {
            if scope.connection().is_closing() {
                debug!("connection closing, skipping dispatch");
                return;
            }

            let label = self.metric_label(&message.message_type);
            let start = Instant::now();
            let result = self.process(&scope, &message).await;
            histogram!(DISPATCH_DURATION_SECONDS, "type" => label.clone())
                .record(start.elapsed().as_secs_f64());

            let Err(err) = result else {
                debug!("message dispatched");
                return;
            };

            match &err {
                DispatchError::Unhandled { message: detail } => {
                    error!(kind = err.kind(), error = %detail, "unhandled error during dispatch");
                }
                _ => debug!(kind = err.kind(), status = err.status(), error = %err, "dispatch fault"),
            }
            counter!(DISPATCH_ERRORS_TOTAL, "type" => label, "kind" => err.kind()).increment(1);

            if !scope.send_error(&message, &err) {
                warn!("failed to deliver error envelope");
            }
        }
        .instrument(span)
        .await;
    }

    /// Release connection-scoped state when a connection closes.
    pub fn cleanup(&self, seed: &ScopeSeed) {
        seed.broadcaster.remove(&seed.client.client_id);
        let topics = seed.subscriptions.clear();
        seed.auth.clear();
        debug!(client_id = %seed.client.client_id, topics, "released connection state");
    }

    fn metric_label(&self, message_type: &str) -> String {
        if self.handlers.has_handler(message_type) {
            message_type.to_owned()
        } else {
            "unknown".to_owned()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handlers::{AllowAll, Authenticated};
    use crate::dispatch::registry::{AuthorizationPredicate, MessageHandler};
    use crate::test_support::{self, recv_json};
    use async_trait::async_trait;
    use rtm_core::logging::capture_logs;
    use rtm_protocol::Fault;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::Level;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(
            &self,
            scope: &ConnectionScope,
            message: &ReceivedMessage,
        ) -> Result<(), HandlerError> {
            let _ = scope.reply(message, "echo", json!({"payload": message.payload}));
            Ok(())
        }
    }

    struct NeedsTopic;

    #[async_trait]
    impl MessageHandler for NeedsTopic {
        fn validate(&self, message: &ReceivedMessage) -> Result<(), Fault> {
            crate::dispatch::validation::require_str(message, "topic").map(|_| ())
        }

        async fn handle(
            &self,
            _scope: &ConnectionScope,
            _message: &ReceivedMessage,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct Failing(fn() -> HandlerError);

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(
            &self,
            _scope: &ConnectionScope,
            _message: &ReceivedMessage,
        ) -> Result<(), HandlerError> {
            Err((self.0)())
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(
            &self,
            _scope: &ConnectionScope,
            _message: &ReceivedMessage,
        ) -> Result<(), HandlerError> {
            panic!("handler exploded")
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counter {
        async fn handle(
            &self,
            _scope: &ConnectionScope,
            _message: &ReceivedMessage,
        ) -> Result<(), HandlerError> {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Deny;

    impl AuthorizationPredicate for Deny {
        fn name(&self) -> &'static str {
            "IsEnrolled"
        }

        fn error_message(&self) -> String {
            "Not enrolled in course".into()
        }

        fn test(&self, _identity: Option<&Identity>, _message: &ReceivedMessage) -> bool {
            false
        }
    }

    fn msg(text: &str) -> ReceivedMessage {
        ReceivedMessage::decode(text).unwrap()
    }

    fn dispatcher(build: impl FnOnce(&mut HandlerRegistry, &mut AuthorizerRegistry)) -> MessageDispatcher {
        let mut handlers = HandlerRegistry::new();
        let mut authorizers = AuthorizerRegistry::new();
        build(&mut handlers, &mut authorizers);
        MessageDispatcher::new(handlers, authorizers)
    }

    #[tokio::test]
    async fn successful_dispatch_replies() {
        let d = dispatcher(|h, a| {
            let _ = h.register("echo", Echo);
            let _ = a.register_default::<AllowAll>("echo");
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"echo","id":"1","text":"hi"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        let reply = recv_json(&mut rx).await;
        assert_eq!(reply["type"], "echo");
        assert_eq!(reply["replyTo"], "1");
        assert_eq!(reply["payload"]["text"], "hi");
    }

    #[tokio::test]
    async fn unknown_type_is_configuration_error() {
        let d = dispatcher(|_, _| {});
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"foo.bar","id":"1"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["replyTo"], "1");
        assert_eq!(err["status"], 501);
        assert!(err["message"].as_str().unwrap().contains("foo.bar"));
    }

    #[test]
    fn missing_authorizer_is_configuration_error() {
        let d = dispatcher(|h, _| {
            let _ = h.register("echo", Echo);
        });
        let err = d.validate(&msg(r#"{"type":"echo","id":"1"}"#)).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("No authorizer"));
    }

    #[test]
    fn handler_validation_fault_maps_status() {
        let d = dispatcher(|h, a| {
            let _ = h.register("subscribe", NeedsTopic);
            let _ = a.register_default::<AllowAll>("subscribe");
        });
        let err = d
            .validate(&msg(r#"{"type":"subscribe","id":"1"}"#))
            .unwrap_err();
        assert_eq!(err.status(), 422);
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn validation_runs_before_authorization() {
        let d = dispatcher(|h, a| {
            let _ = h.register("subscribe", NeedsTopic);
            let _ = a.register("subscribe", || Deny);
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"subscribe","id":"1"}"#);
        d.dispatch(seed.scope_for(&message), message).await;
        assert_eq!(recv_json(&mut rx).await["status"], 422);
    }

    #[tokio::test]
    async fn unauthorized_names_predicate_and_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let d = dispatcher(move |h, a| {
            let _ = h.register("grades.view", Counter(handler_calls));
            let _ = a.register("grades.view", || Deny);
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"grades.view","id":"7"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["status"], 401);
        assert_eq!(err["replyTo"], "7");
        let text = err["message"].as_str().unwrap();
        assert!(text.contains("Not enrolled in course"));
        assert!(text.contains("IsEnrolled"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn authorization_uses_scope_identity() {
        let d = dispatcher(|h, a| {
            let _ = h.register("echo", Echo);
            let _ = a.register_default::<Authenticated>("echo");
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"echo","id":"1"}"#);

        d.dispatch(seed.scope_for(&message), message.clone()).await;
        assert_eq!(recv_json(&mut rx).await["status"], 401);

        seed.auth.install(Identity::new("alice"));
        d.dispatch(seed.scope_for(&message), message).await;
        assert_eq!(recv_json(&mut rx).await["type"], "echo");
    }

    #[tokio::test]
    async fn handler_fault_uses_declared_status() {
        let d = dispatcher(|h, a| {
            let _ = h.register(
                "course.get",
                Failing(|| Fault::not_found("no such course").into()),
            );
            let _ = a.register_default::<AllowAll>("course.get");
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"course.get","id":"3"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["status"], 404);
        assert_eq!(err["message"], "no such course");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unhandled_error_is_logged_and_sanitized() {
        let (logs, _guard) = capture_logs();
        let d = dispatcher(|h, a| {
            let _ = h.register(
                "explode",
                Failing(|| anyhow::anyhow!("disk full at /var/lib/rtm").into()),
            );
            let _ = a.register_default::<AllowAll>("explode");
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"explode","id":"9"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["status"], 500);
        assert_eq!(err["replyTo"], "9");
        assert_eq!(err["message"], "Internal server error");

        let event = logs.find("unhandled error").expect("error log");
        assert_eq!(event.level, Level::ERROR);
        assert!(event.field("error").unwrap().contains("disk full"));
        assert!(logs.has_span("rtm.dispatch"));
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let d = dispatcher(|h, a| {
            let _ = h.register("explode", Panicking);
            let _ = a.register_default::<AllowAll>("explode");
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"explode","id":"5"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["status"], 500);
        assert_eq!(err["message"], "Internal server error");
    }

    #[tokio::test]
    async fn handlers_run_in_order_and_stop_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&calls);
        let last = Arc::clone(&calls);
        let d = dispatcher(move |h, a| {
            let _ = h
                .register("multi", Counter(first))
                .register("multi", Failing(|| Fault::forbidden("stop").into()))
                .register("multi", Counter(last));
            let _ = a.register_default::<AllowAll>("multi");
        });
        let (seed, mut rx) = test_support::seed();
        let message = msg(r#"{"type":"multi","id":"1"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        assert_eq!(recv_json(&mut rx).await["status"], 403);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closing_connection_skips_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let d = dispatcher(move |h, a| {
            let _ = h.register("count", Counter(handler_calls));
            let _ = a.register_default::<AllowAll>("count");
        });
        let (seed, mut rx) = test_support::seed();
        seed.connection.begin_close();
        let message = msg(r#"{"type":"count","id":"1"}"#);
        d.dispatch(seed.scope_for(&message), message).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cleanup_releases_state() {
        let d = dispatcher(|_, _| {});
        let (seed, _rx) = test_support::seed();
        seed.broadcaster
            .add(Arc::clone(&seed.connection), Arc::clone(&seed.subscriptions));
        let _ = seed.subscriptions.subscribe("grades");
        seed.auth.install(Identity::new("alice"));

        d.cleanup(&seed);
        assert!(seed.subscriptions.topics().is_empty());
        assert!(!seed.auth.is_authenticated());
        assert_eq!(seed.broadcaster.connection_count(), 0);
    }
}
