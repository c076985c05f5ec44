//! HS256 bearer tokens.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use rtm_core::Identity;
use rtm_settings::AuthSettings;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthError, Authenticator};

/// Claims carried by a handshake token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject, becomes [`Identity::subject`].
    pub sub: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiry (Unix seconds).
    pub exp: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
    require_token: bool,
}

impl JwtAuthenticator {
    /// Verify with `secret`. Connections without a token are admitted
    /// anonymously unless `require_token` is set.
    pub fn new(secret: &str, require_token: bool) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            require_token,
        }
    }

    /// Also require the `iss` claim to equal `issuer`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Build from settings. `None` when no secret is configured.
    pub fn from_settings(settings: &AuthSettings) -> Option<Self> {
        let secret = settings.jwt_secret.as_deref()?;
        let auth = Self::new(secret, settings.require_token);
        Some(match settings.issuer.as_deref() {
            Some(issuer) => auth.with_issuer(issuer),
            None => auth,
        })
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<Option<Identity>, AuthError> {
        let Some(token) = token else {
            return if self.require_token {
                Err(AuthError::MissingToken)
            } else {
                Ok(None)
            };
        };
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                ErrorKind::InvalidSignature => "invalid signature",
                ErrorKind::InvalidIssuer => "invalid issuer",
                _ => "malformed token",
            };
            AuthError::InvalidToken(reason.into())
        })?;
        let claims = data.claims;
        let identity = claims
            .roles
            .into_iter()
            .fold(Identity::new(claims.sub), |identity, role| identity.with_role(role));
        Ok(Some(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret-with-enough-entropy-0123456789";

    fn token(secret: &str, exp_offset: i64, iss: Option<&str>) -> String {
        let exp = u64::try_from(chrono::Utc::now().timestamp() + exp_offset).unwrap();
        let claims = Claims {
            sub: "alice".into(),
            roles: vec!["publisher".into()],
            exp,
            iss: iss.map(String::from),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_identity() {
        let auth = JwtAuthenticator::new(SECRET, false);
        let identity = auth
            .authenticate(Some(&token(SECRET, 3600, None)))
            .unwrap()
            .unwrap();
        assert_eq!(identity.subject, "alice");
        assert!(identity.has_role("publisher"));
    }

    #[test]
    fn missing_token_depends_on_requirement() {
        assert_eq!(JwtAuthenticator::new(SECRET, false).authenticate(None), Ok(None));
        assert_eq!(
            JwtAuthenticator::new(SECRET, true).authenticate(None),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn wrong_secret_rejected() {
        let auth = JwtAuthenticator::new(SECRET, false);
        let err = auth
            .authenticate(Some(&token("another-secret-entirely-0123456789", 3600, None)))
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken("invalid signature".into()));
    }

    #[test]
    fn expired_token_rejected() {
        let auth = JwtAuthenticator::new(SECRET, false);
        let err = auth
            .authenticate(Some(&token(SECRET, -3600, None)))
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken("token expired".into()));
    }

    #[test]
    fn garbage_rejected() {
        let auth = JwtAuthenticator::new(SECRET, false);
        assert!(matches!(
            auth.authenticate(Some("not-a-jwt")),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn issuer_is_checked() {
        let auth = JwtAuthenticator::new(SECRET, false).with_issuer("rtm");
        assert!(auth.authenticate(Some(&token(SECRET, 3600, Some("rtm")))).is_ok());
        assert_eq!(
            auth.authenticate(Some(&token(SECRET, 3600, Some("other")))),
            Err(AuthError::InvalidToken("invalid issuer".into()))
        );
    }

    #[test]
    fn from_settings_needs_secret() {
        let mut settings = AuthSettings::default();
        assert!(JwtAuthenticator::from_settings(&settings).is_none());
        settings.jwt_secret = Some(SECRET.into());
        settings.require_token = true;
        let auth = JwtAuthenticator::from_settings(&settings).unwrap();
        assert_eq!(auth.authenticate(None), Err(AuthError::MissingToken));
    }
}
