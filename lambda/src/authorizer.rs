//! Bearer token validation for local runs.
//!
//! Deployed, the API Gateway authorizer validates tokens before the function
//! runs. Locally this middleware plays that role: it accepts only ID tokens
//! issued by the configured directory to the configured client, and rejects
//! everything else before a handler runs.

use crate::errors::ApiError;
use crate::handlers::Caller;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// `token_use` of directory ID tokens.
pub const ID_TOKEN_USE: &str = "id";

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    token_use: String,
    #[serde(default)]
    email: Option<String>,
}

/// Validates directory ID tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    issuer: String,
    audience: String,
    key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Verifier for HS256 tokens signed with a shared secret.
    pub fn hs256(issuer: impl Into<String>, audience: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            key: DecodingKey::from_secret(secret),
            algorithm: Algorithm::HS256,
        }
    }

    /// Verifier for RS256 tokens, given the signing key's public PEM.
    pub fn rs256(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        public_key_pem: &[u8],
    ) -> Result<Self, ApiError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| ApiError::Internal(format!("Invalid RSA public key: {e}")))?;
        Ok(Self {
            issuer: issuer.into(),
            audience: audience.into(),
            key,
            algorithm: Algorithm::RS256,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Checks signature, expiry, issuer, audience and token use.
    pub fn verify(&self, token: &str) -> Result<Caller, ApiError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = decode::<IdTokenClaims>(token, &self.key, &validation).map_err(|e| {
            warn!("Failed to verify token: {}", e);
            ApiError::Unauthorized(format!("Token verification failed: {e}"))
        })?;

        let claims = data.claims;
        if claims.token_use != ID_TOKEN_USE {
            return Err(ApiError::Unauthorized(format!(
                "Expected an ID token, got token_use {:?}",
                claims.token_use
            )));
        }

        debug!(sub = %claims.sub, "Token verified");
        Caller::new(claims.sub, claims.email)
    }
}

/// Extracts the token from an `Authorization` value. The `Bearer` prefix is optional,
/// matching what the Cognito authorizer accepts.
pub fn bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        Some(_) => return None,
        None => value,
    };
    (!token.is_empty()).then_some(token)
}

/// Middleware rejecting requests without a valid token and attaching the [`Caller`].
pub async fn require_token(
    State(verifier): State<Arc<TokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let caller = verifier.verify(token)?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use time::OffsetDateTime;

    const SECRET: &[u8] = b"local-test-secret";
    const ISSUER: &str = "https://cognito-idp.us-west-2.amazonaws.com/us-west-2_Test";

    fn verifier() -> TokenVerifier {
        TokenVerifier::hs256(ISSUER, "client-1", SECRET)
    }

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn claims() -> serde_json::Value {
        json!({
            "sub": "user-1",
            "iss": ISSUER,
            "aud": "client-1",
            "token_use": "id",
            "email": "user@example.com",
            "exp": OffsetDateTime::now_utc().unix_timestamp() + 3600,
        })
    }

    #[test]
    fn test_accepts_id_token() {
        let caller = verifier().verify(&token(claims())).unwrap();
        assert_eq!(caller.sub, "user-1");
        assert_eq!(caller.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_rejects_wrong_audience_issuer_and_use() {
        let cases = [
            ("aud", json!("other-client")),
            ("iss", json!("https://cognito-idp.us-west-2.amazonaws.com/other")),
            ("token_use", json!("access")),
            ("exp", json!(OffsetDateTime::now_utc().unix_timestamp() - 3600)),
        ];
        for (field, value) in cases {
            let mut claims = claims();
            claims[field] = value;
            let result = verifier().verify(&token(claims));
            assert!(matches!(result, Err(ApiError::Unauthorized(_))), "{field}");
        }
    }

    #[test]
    fn test_rejects_foreign_signature() {
        let other_key = EncodingKey::from_secret(b"other");
        let forged = encode(&Header::default(), &claims(), &other_key).unwrap();
        assert!(verifier().verify(&forged).is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token(""), None);
    }
}
