//! Claims validation.
//!
//! Turns the claims of a completed OIDC authentication into
//! [`NormalizedClaims`], rejecting tokens from unknown issuers, expired tokens
//! and tokens missing the fields reconciliation depends on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::OidcConfig;
use crate::error::{ReconcileError, Result};

/// Upper bound on a configured session lifetime: 100 years.
const MAX_SESSION_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// ID token claims as issued by the provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawClaims {
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Either a single audience string or an array of them.
    #[serde(default)]
    pub aud: serde_json::Value,
    #[serde(default)]
    pub exp: Option<i64>,
    /// Per-app roles, consulted only by the admin surface.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl RawClaims {
    pub fn audiences(&self) -> Vec<&str> {
        match &self.aud {
            serde_json::Value::String(aud) => vec![aud.as_str()],
            serde_json::Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
            _ => vec![],
        }
    }
}

/// A completed authentication as delivered by the callback layer.
#[derive(Debug, Clone)]
pub struct RawAuthentication {
    pub claims: RawClaims,
    /// Whether the authorization code was exchanged with a PKCE verifier.
    pub pkce_used: bool,
}

impl RawAuthentication {
    pub fn new(claims: RawClaims) -> Self {
        Self {
            claims,
            pkce_used: false,
        }
    }
}

/// Claims that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedClaims {
    pub issuer: String,
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub preferred_username: String,
    /// When the resulting node session ends.
    pub session_expiry: DateTime<Utc>,
}

impl NormalizedClaims {
    /// Unique key of the external account: `issuer/subject`.
    pub fn provider_id(&self) -> String {
        format!("{}/{}", self.issuer, self.subject)
    }

    /// Email the provider vouches for, if any.
    pub fn verified_email(&self) -> Option<&str> {
        self.email.as_deref().filter(|_| self.email_verified)
    }
}

/// Issuer, subject and expiry of a token that passed [`ClaimsPolicy::check_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFacts<'a> {
    pub issuer: &'a str,
    pub subject: &'a str,
    pub expiry: DateTime<Utc>,
}

/// Validation settings derived from [`OidcConfig`].
#[derive(Debug, Clone)]
pub struct ClaimsPolicy {
    pub allowed_issuers: Vec<String>,
    pub audience: Option<String>,
    pub pkce_required: bool,
    pub use_expiry_from_token: bool,
    pub session_ttl: Duration,
}

impl ClaimsPolicy {
    pub fn from_config(oidc: &OidcConfig) -> Self {
        Self {
            allowed_issuers: oidc.issuer_allow_list(),
            audience: oidc.audience.clone().filter(|a| !a.is_empty()),
            pkce_required: oidc.pkce_enabled,
            use_expiry_from_token: oidc.use_expiry_from_token,
            session_ttl: Duration::seconds(oidc.expiry_secs.min(MAX_SESSION_TTL_SECS) as i64),
        }
    }

    /// Issuer, subject, expiry and audience checks shared by logins and
    /// bearer tokens on the admin surface.
    pub fn check_token<'a>(&self, claims: &'a RawClaims, now: DateTime<Utc>) -> Result<TokenFacts<'a>> {
        let issuer = claims.iss.trim().trim_end_matches('/');
        if issuer.is_empty() || !self.allowed_issuers.iter().any(|allowed| allowed == issuer) {
            return Err(ReconcileError::InvalidIssuer(claims.iss.clone()));
        }

        let subject = claims
            .sub
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReconcileError::ClaimsMalformed("missing subject".to_string()))?;

        let exp = claims
            .exp
            .ok_or_else(|| ReconcileError::ClaimsMalformed("missing exp".to_string()))?;
        let expiry = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| ReconcileError::ClaimsMalformed(format!("exp out of range: {}", exp)))?;
        if expiry <= now {
            return Err(ReconcileError::ExpiredToken(expiry));
        }

        if let Some(required) = &self.audience {
            if !claims.audiences().iter().any(|aud| *aud == required.as_str()) {
                return Err(ReconcileError::ClaimsMalformed(format!(
                    "audience {} not present",
                    required
                )));
            }
        }

        Ok(TokenFacts {
            issuer,
            subject,
            expiry,
        })
    }

    pub fn validate(&self, auth: &RawAuthentication, now: DateTime<Utc>) -> Result<NormalizedClaims> {
        let claims = &auth.claims;
        let TokenFacts {
            issuer,
            subject,
            expiry: token_expiry,
        } = self.check_token(claims, now)?;

        if self.pkce_required && !auth.pkce_used {
            return Err(ReconcileError::ClaimsMalformed(
                "PKCE is required but was not used".to_string(),
            ));
        }

        let email = claims
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);

        let preferred_username = claims
            .preferred_username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| {
                email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .filter(|local| !local.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| subject.to_string());

        let session_expiry = if self.use_expiry_from_token {
            token_expiry
        } else {
            now + self.session_ttl
        };

        Ok(NormalizedClaims {
            issuer: issuer.to_string(),
            subject: subject.to_string(),
            email,
            email_verified: claims.email_verified,
            preferred_username,
            session_expiry,
        })
    }
}
