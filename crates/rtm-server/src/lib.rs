//! # rtm-server
//!
//! Real-time messaging broker served over axum `WebSocket`s.
//!
//! - Per-connection [`ConnectionBroker`](websocket::broker::ConnectionBroker):
//!   handshake, frame parsing, `WAIT_PENDING` flow control, close sequence
//! - Per-connection [`ConnectionExecutor`](websocket::executor::ConnectionExecutor):
//!   bounded worker pool over an unbounded queue
//! - [`MessageDispatcher`](dispatch::dispatcher::MessageDispatcher): validate,
//!   authorize and route each message, converting faults to error envelopes
//! - Process-wide [`ConnectionRegistry`](websocket::registry::ConnectionRegistry):
//!   membership and coordinated, timeout-bounded graceful shutdown
//! - HTTP endpoints: `/health`, `/metrics`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;
