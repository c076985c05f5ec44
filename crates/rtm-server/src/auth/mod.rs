//! Handshake authentication.
//!
//! The bearer token is read from the upgrade request (`Authorization:
//! Bearer <t>` header, else the `token` query parameter) and handed to the
//! configured [`Authenticator`]. A rejected token refuses the connection
//! before it is registered; an accepted one seeds the connection's
//! `AuthContext`.

pub mod jwt;

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use rtm_core::Identity;

pub use jwt::JwtAuthenticator;

/// Why a handshake token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// A token is required but none was presented.
    #[error("authentication token required")]
    MissingToken,
    /// The token failed verification.
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Resolves an identity from a handshake token.
#[cfg_attr(test, mockall::automock)]
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` admits the connection anonymously.
    #[allow(clippy::needless_lifetimes)]
    fn authenticate<'a>(&self, token: Option<&'a str>) -> Result<Option<Identity>, AuthError>;
}

/// Admits every connection without an identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthenticator;

impl Authenticator for AnonymousAuthenticator {
    fn authenticate(&self, _token: Option<&str>) -> Result<Option<Identity>, AuthError> {
        Ok(None)
    }
}

/// Pull the handshake token from the request.
pub fn extract_token<'a>(
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
) -> Option<&'a str> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    from_header.or_else(|| {
        query
            .get("token")
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    })
}

/// Extract the token and run it through `authenticator`.
pub fn authenticate_request(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Option<Identity>, AuthError> {
    authenticator.authenticate(extract_token(headers, query))
}
