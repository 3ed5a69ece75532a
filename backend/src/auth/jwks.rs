use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{AuthError, TokenVerifier};
use crate::reconcile::RawClaims;

/// JWKS key set response.
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

/// Shortest gap between two key set fetches triggered by unknown kids.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Verifies RS256 ID tokens against the provider's published key set.
pub struct JwksClient {
    http_client: Client,
    jwks_uri: String,
    keys: Arc<RwLock<HashMap<String, DecodingKey>>>,
    last_refresh: Mutex<Instant>,
    min_refresh_interval: Duration,
}

impl JwksClient {
    /// Discover the provider's JWKS endpoint and load its keys.
    pub async fn new(issuer: &str) -> Result<Self, AuthError> {
        let http_client = Client::new();

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: DiscoveryDocument = http_client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        let client = Self {
            http_client,
            jwks_uri: discovery.jwks_uri,
            keys: Arc::new(RwLock::new(HashMap::new())),
            last_refresh: Mutex::new(Instant::now()),
            min_refresh_interval: MIN_REFRESH_INTERVAL,
        };
        client.refresh_keys().await?;

        Ok(client)
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Claim the next refetch slot, or `false` if the last one was too recent.
    fn refresh_due(&self) -> bool {
        let mut last = self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if last.elapsed() < self.min_refresh_interval {
            return false;
        }
        *last = Instant::now();
        true
    }

    async fn refresh_keys(&self) -> Result<(), AuthError> {
        tracing::info!("Fetching JWKS from {}", self.jwks_uri);

        let response: JwksResponse = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        let mut keys = self.keys.write().await;
        keys.clear();

        for jwk in response.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            if let (Some(n), Some(e)) = (&jwk.n, &jwk.e) {
                match DecodingKey::from_rsa_components(n, e) {
                    Ok(key) => {
                        keys.insert(jwk.kid.clone(), key);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse RSA key {}: {}", jwk.kid, e);
                    }
                }
            }
        }

        tracing::info!("Loaded {} JWKS keys", keys.len());
        Ok(())
    }

    async fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().await.get(kid).cloned()
    }

    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }
}

#[async_trait]
impl TokenVerifier for JwksClient {
    async fn verify(&self, token: &str) -> Result<RawClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("Missing kid in token header".to_string()))?;

        // Providers rotate keys; an unknown kid triggers a refetch, at most
        // once per refresh interval.
        let key = match self.key_for(&kid).await {
            Some(key) => key,
            None if !self.refresh_due() => {
                tracing::debug!("Unknown kid {}, JWKS fetched recently", kid);
                return Err(AuthError::KeyNotFound(kid));
            }
            None => {
                tracing::debug!("Unknown kid {}, refreshing JWKS", kid);
                self.refresh_keys().await?;
                self.key_for(&kid)
                    .await
                    .ok_or_else(|| AuthError::KeyNotFound(kid.clone()))?
            }
        };

        // Issuer, exp and aud are checked by the claims policy.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<RawClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(token_data.claims)
    }
}
