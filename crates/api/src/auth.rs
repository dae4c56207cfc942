//! Authentication middleware for Axum
//!
//! Merchant endpoints take a Whop user token; cron endpoints take the shared
//! cron secret as a bearer token.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::{config::ConfigError, config::UserTokenKey, error::ApiError, state::AppState};

pub const USER_TOKEN_HEADER: &str = "x-whop-user-token";

/// Authenticated Whop user, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct UserClaims {
    sub: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid cron secret")]
    InvalidCronSecret,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidToken => "Invalid or expired token",
            AuthError::InvalidCronSecret => "Invalid cron secret",
        };
        ApiError::Unauthorized(message).into_response()
    }
}

/// Verifies Whop user tokens and yields the user id (`sub`)
pub struct UserTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl UserTokenVerifier {
    pub fn new(key: &UserTokenKey, audience: Option<&str>) -> Result<Self, ConfigError> {
        let (key, algorithm) = match key {
            UserTokenKey::Es256PublicKey(pem) => (
                DecodingKey::from_ec_pem(pem.as_bytes())
                    .map_err(|_| ConfigError::Invalid("WHOP_USER_TOKEN_PUBLIC_KEY"))?,
                Algorithm::ES256,
            ),
            UserTokenKey::Hs256Secret(secret) => {
                (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
            }
        };

        let mut validation = Validation::new(algorithm);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }

    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<UserClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "User token rejected");
            AuthError::InvalidToken
        })?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims.sub)
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Whop's header first, then a standard bearer token
fn extract_user_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .or_else(|| extract_bearer_token(headers))
}

/// Middleware that requires a valid Whop user token
pub async fn require_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_user_token(request.headers()) else {
        return AuthError::MissingAuth.into_response();
    };

    match state.user_tokens.verify(token) {
        Ok(user_id) => {
            request.extensions_mut().insert(AuthUser { user_id });
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %request.uri().path(), "require_user: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires the cron secret as bearer token
pub async fn require_cron(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(request.headers()) else {
        return AuthError::MissingAuth.into_response();
    };

    let matches: bool = token
        .as_bytes()
        .ct_eq(state.config.cron_secret.as_bytes())
        .into();
    if !matches {
        tracing::warn!(path = %request.uri().path(), "require_cron: invalid secret");
        return AuthError::InvalidCronSecret.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        aud: Option<&'a str>,
    }

    fn token(secret: &str, sub: &str, exp_offset: i64, aud: Option<&str>) -> String {
        let exp = time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset;
        encode(
            &Header::default(),
            &Claims { sub, exp, aud },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier(aud: Option<&str>) -> UserTokenVerifier {
        UserTokenVerifier::new(&UserTokenKey::Hs256Secret("test-secret".into()), aud).unwrap()
    }

    #[test]
    fn test_valid_token_yields_user_id() {
        let user = verifier(None).verify(&token("test-secret", "user_123", 3600, None));
        assert_eq!(user.unwrap(), "user_123");
    }

    #[test]
    fn test_expired_token_rejected() {
        let result = verifier(None).verify(&token("test-secret", "user_123", -3600, None));
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let result = verifier(None).verify(&token("other-secret", "user_123", 3600, None));
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_audience_enforced_when_configured() {
        let v = verifier(Some("app_stacker"));
        assert!(v
            .verify(&token("test-secret", "user_1", 3600, Some("app_stacker")))
            .is_ok());
        assert!(v
            .verify(&token("test-secret", "user_1", 3600, Some("app_other")))
            .is_err());
    }

    #[test]
    fn test_bad_pem_is_config_error() {
        let result = UserTokenVerifier::new(&UserTokenKey::Es256PublicKey("nope".into()), None);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("WHOP_USER_TOKEN_PUBLIC_KEY"))
        ));
    }

    #[test]
    fn test_user_token_header_preferred() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_TOKEN_HEADER, "from-whop".parse().unwrap());
        headers.insert(AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        assert_eq!(extract_user_token(&headers), Some("from-whop"));

        headers.remove(USER_TOKEN_HEADER);
        assert_eq!(extract_user_token(&headers), Some("from-bearer"));
    }
}
