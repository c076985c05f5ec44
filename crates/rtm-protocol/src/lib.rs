//! # rtm-protocol
//!
//! JSON wire format spoken over the RTM `WebSocket`:
//! - Inbound [`ReceivedMessage`] envelopes with per-message [`FlowControlMode`]
//! - Outbound [`OutboundEnvelope`]s (`hello`, `error`, `shutdown`, `event`) and
//!   handler replies built with [`reply`]
//! - The [`DispatchError`] fault taxonomy and its numeric [`status`] codes
//! - RFC 6455 [`CloseCode`]s used when the server closes a connection

#![deny(unsafe_code)]

pub mod close;
pub mod errors;
pub mod status;
pub mod types;

pub use close::CloseCode;
pub use errors::{DispatchError, Fault};
pub use types::{FlowControlMode, OutboundEnvelope, ReceivedMessage, reply};
