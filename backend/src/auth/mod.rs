//! ID token verification.
//!
//! [`TokenVerifier`] checks a token's signature and hands back its raw
//! claims. Issuer, expiry and audience rules are enforced afterwards by
//! [`ClaimsPolicy`](crate::reconcile::ClaimsPolicy) against the injected
//! clock, so a verifier only proves the token was signed by the provider.
//! Admin callers go through
//! [`Reconciler::authorize_admin`](crate::reconcile::Reconciler::authorize_admin)
//! for the same checks plus the `admin` role.

pub mod jwks;

use async_trait::async_trait;
use axum::http::HeaderMap;

pub use jwks::JwksClient;

use crate::reconcile::RawClaims;

/// Caller identity for the admin surface.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub sub: String,
    pub email: Option<String>,
    /// Per-app roles from the OIDC provider.
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Invalid Authorization header format")]
    InvalidFormat,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("JWKS fetch error: {0}")]
    JwksFetchError(String),
    #[error("Key not found for kid: {0}")]
    KeyNotFound(String),
}

/// Extract the token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidFormat)
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify the token's signature and return its claims.
    async fn verify(&self, token: &str) -> Result<RawClaims, AuthError>;
}
