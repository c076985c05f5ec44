//! `WebSocket` transport: connection state, per-connection broker and
//! executor, process-wide registry, heartbeat and the socket session loop.

pub mod broadcast;
pub mod broker;
pub mod connection;
pub mod executor;
pub mod heartbeat;
pub mod registry;
pub mod session;
