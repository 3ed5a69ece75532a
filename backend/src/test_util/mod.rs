//! Helpers shared by unit and integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

use crate::auth::{AuthError, TokenVerifier};
use crate::clock::Clock;
use crate::config::{Config, DatabaseConfig, LoggingConfig, OidcConfig, ServerConfig, SessionConfig};
use crate::reconcile::{RawClaims, Reconciler};
use crate::store::Store;
use crate::AppState;

pub const TEST_ISSUER: &str = "http://idp.test/oidc";

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        database: DatabaseConfig {
            url: "memory".to_string(),
        },
        oidc: OidcConfig::for_issuer(TEST_ISSUER),
        session: SessionConfig {
            sweep_interval_secs: 1,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
    }
}

/// Claims shaped like the mock provider's users: subject and username are the
/// user name, email is `<name>@headscale.net`.
pub fn oidc_claims(issuer: &str, username: &str, email_verified: bool, exp: DateTime<Utc>) -> RawClaims {
    RawClaims {
        iss: issuer.to_string(),
        sub: Some(username.to_string()),
        email: Some(format!("{}@headscale.net", username)),
        email_verified,
        preferred_username: Some(username.to_string()),
        name: Some(username.to_string()),
        exp: Some(exp.timestamp()),
        ..Default::default()
    }
}

/// Verifier that maps opaque tokens to fixed claims.
#[derive(Debug, Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, RawClaims>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, claims: RawClaims) -> Self {
        self.tokens.insert(token.to_string(), claims);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<RawClaims, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown test token".to_string()))
    }
}

pub fn test_state(
    config: Config,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    verifier: StaticVerifier,
) -> Arc<AppState> {
    let reconciler = Arc::new(Reconciler::new(store, clock, &config.oidc));
    Arc::new(AppState {
        config,
        verifier: Arc::new(verifier),
        reconciler,
    })
}

/// Sign `claims` as an RS256 ID token.
pub fn sign_test_token(claims: &RawClaims, kid: &str, signing_key: &EncodingKey) -> String {
    let header = Header {
        alg: Algorithm::RS256,
        kid: Some(kid.to_string()),
        ..Default::default()
    };

    encode(&header, claims, signing_key).expect("Failed to encode JWT")
}
