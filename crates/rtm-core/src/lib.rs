//! # rtm-core
//!
//! Foundation types shared by every RTM crate:
//! - Branded IDs ([`ClientId`], [`TraceId`])
//! - Authenticated [`Identity`] and the per-connection [`AuthContext`] slot
//! - `tracing` subscriber setup and log-capture test utilities

#![deny(unsafe_code)]

pub mod identity;
pub mod ids;
pub mod logging;

pub use identity::{AuthContext, Identity};
pub use ids::{ClientId, TraceId};
