//! Numeric status codes carried by `error` envelopes.

/// Malformed or undecodable envelope.
pub const BAD_REQUEST: u16 = 400;
/// An authorization predicate rejected the message.
pub const UNAUTHORIZED: u16 = 401;
/// Business-level refusal.
pub const FORBIDDEN: u16 = 403;
/// Referenced resource does not exist.
pub const NOT_FOUND: u16 = 404;
/// Frame kind the broker does not accept (binary frames).
pub const UNSUPPORTED_MESSAGE_TYPE: u16 = 415;
/// A handler rejected a required or invalid field.
pub const UNPROCESSABLE: u16 = 422;
/// Unhandled server-side failure.
pub const INTERNAL_ERROR: u16 = 500;
/// No handler or no authorizer registered for the message type.
pub const NOT_CONFIGURED: u16 = 501;
