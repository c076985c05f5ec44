//! Dispatch fault taxonomy.
//!
//! Every failure intercepted at the dispatch boundary becomes exactly one
//! [`DispatchError`], which in turn becomes exactly one `error` envelope.

use crate::status;
use crate::types::OutboundEnvelope;

/// A recognized business fault carrying a declared client-facing status.
///
/// Handlers raise these from `validate` and `handle`; they are reported to
/// the client at `status` and are not logged as server errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Fault {
    /// Declared status code.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
}

impl Fault {
    /// Fault with an explicit status.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Missing or invalid field (422).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(status::UNPROCESSABLE, message)
    }

    /// Malformed request content (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(status::BAD_REQUEST, message)
    }

    /// Referenced resource does not exist (404).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(status::NOT_FOUND, message)
    }

    /// Business-level refusal (403).
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(status::FORBIDDEN, message)
    }
}

/// Client-facing dispatch failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Malformed or unsupported envelope; the connection stays open.
    #[error("{message}")]
    Deserialization {
        /// Description of what is wrong.
        message: String,
    },

    /// No handler or no authorizer registered for the message type.
    #[error("{message}")]
    Configuration {
        /// Description.
        message: String,
    },

    /// A handler rejected a required or invalid field.
    #[error("{message}")]
    Validation {
        /// Handler-declared status.
        status: u16,
        /// Description.
        message: String,
    },

    /// An authorization predicate rejected the message.
    #[error("{message} (predicate: {predicate})")]
    Unauthorized {
        /// Name of the first failing predicate.
        predicate: String,
        /// The predicate's declared message.
        message: String,
    },

    /// A handler raised a recognized fault.
    #[error("{message}")]
    Handler {
        /// Business-declared status.
        status: u16,
        /// Description.
        message: String,
    },

    /// Anything else. Logged server-side; the client sees a generic message.
    #[error("{message}")]
    Unhandled {
        /// Server-side description (never sent to the client).
        message: String,
    },
}

impl DispatchError {
    /// Status code carried by the error envelope.
    pub fn status(&self) -> u16 {
        match self {
            Self::Deserialization { .. } => status::BAD_REQUEST,
            Self::Configuration { .. } => status::NOT_CONFIGURED,
            Self::Validation { status, .. } | Self::Handler { status, .. } => *status,
            Self::Unauthorized { .. } => status::UNAUTHORIZED,
            Self::Unhandled { .. } => status::INTERNAL_ERROR,
        }
    }

    /// Short machine-readable kind, used as a log field and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deserialization { .. } => "deserialization",
            Self::Configuration { .. } => "configuration",
            Self::Validation { .. } => "validation",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Handler { .. } => "handler",
            Self::Unhandled { .. } => "unhandled",
        }
    }

    /// Message safe to show the client.
    ///
    /// Unhandled errors are replaced by a generic message so internal details
    /// never leak.
    pub fn client_message(&self) -> String {
        match self {
            Self::Unhandled { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Build the error envelope for this failure.
    pub fn to_envelope(&self, reply_to: Option<String>) -> OutboundEnvelope {
        OutboundEnvelope::error(reply_to, self.status(), self.client_message())
    }

    /// A validation fault raised by a handler's `validate`.
    pub fn from_validation(fault: Fault) -> Self {
        Self::Validation {
            status: fault.status,
            message: fault.message,
        }
    }
}

impl From<Fault> for DispatchError {
    fn from(fault: Fault) -> Self {
        Self::Handler {
            status: fault.status,
            message: fault.message,
        }
    }
}
