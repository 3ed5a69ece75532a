use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use jsonwebtoken::EncodingKey;
use meshgate_backend::auth::bearer_token;
use meshgate_backend::config::OidcConfig;
use meshgate_backend::test_util::{oidc_claims, sign_test_token};
use meshgate_backend::{
    AuthError, JwksClient, MemoryStore, ReconcileError, Reconciler, SystemClock, TokenVerifier,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_KEY_PEM: &str = include_str!("fixtures/test_rsa.pem");
const TEST_KEY_N: &str = include_str!("fixtures/test_rsa.n");

fn signing_key() -> EncodingKey {
    EncodingKey::from_rsa_pem(TEST_KEY_PEM.as_bytes()).unwrap()
}

fn jwks(kid: &str) -> serde_json::Value {
    json!({
        "keys": [
            {"kid": "ec-key", "kty": "EC", "crv": "P-256", "x": "AA", "y": "AA"},
            {"kid": kid, "kty": "RSA", "alg": "RS256", "n": TEST_KEY_N.trim(), "e": "AQAB"}
        ]
    })
}

async fn mount_jwks(server: &MockServer, kid: &str, fetches: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks(kid)));
    match fetches {
        Some(n) => mock.expect(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

async fn provider_expecting(kid: &str, fetches: Option<u64>) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/jwks", server.uri()),
        })))
        .mount(&server)
        .await;
    mount_jwks(&server, kid, fetches).await;

    server
}

async fn provider(kid: &str) -> MockServer {
    provider_expecting(kid, None).await
}

#[tokio::test]
async fn test_discovery_loads_rsa_keys_only() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&format!("{}/", server.uri())).await.unwrap();
    assert_eq!(client.key_count().await, 1);
}

#[tokio::test]
async fn test_verify_returns_claims() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri()).await.unwrap();

    let claims = oidc_claims(&server.uri(), "user1", true, Utc::now() + Duration::minutes(5));
    let token = sign_test_token(&claims, "key-1", &signing_key());

    let verified = client.verify(&token).await.unwrap();
    assert_eq!(verified.iss, server.uri());
    assert_eq!(verified.sub.as_deref(), Some("user1"));
    assert!(verified.email_verified);
    assert_eq!(verified.exp, claims.exp);
}

#[tokio::test]
async fn test_expired_token_still_verifies() {
    // Expiry is judged by the claims policy against the injected clock.
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri()).await.unwrap();

    let claims = oidc_claims(&server.uri(), "user1", true, Utc::now() - Duration::hours(1));
    let token = sign_test_token(&claims, "key-1", &signing_key());
    assert!(client.verify(&token).await.is_ok());
}

#[tokio::test]
async fn test_unknown_kid_rejected_after_refresh() {
    let server = provider_expecting("key-1", Some(2)).await;
    let client = JwksClient::new(&server.uri())
        .await
        .unwrap()
        .with_min_refresh_interval(StdDuration::ZERO);

    let claims = oidc_claims(&server.uri(), "user1", true, Utc::now() + Duration::minutes(5));
    let token = sign_test_token(&claims, "rotated-away", &signing_key());

    let err = client.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::KeyNotFound(kid) if kid == "rotated-away"));
}

#[tokio::test]
async fn test_unknown_kids_do_not_hammer_the_provider() {
    // Discovery fetches the key set once; unknown kids right after it
    // must not fetch it again.
    let server = provider_expecting("key-1", Some(1)).await;
    let client = JwksClient::new(&server.uri()).await.unwrap();

    let claims = oidc_claims(&server.uri(), "user1", true, Utc::now() + Duration::minutes(5));
    for kid in ["made-up-1", "made-up-2", "made-up-1"] {
        let token = sign_test_token(&claims, kid, &signing_key());
        assert!(matches!(
            client.verify(&token).await,
            Err(AuthError::KeyNotFound(_))
        ));
    }

    let token = sign_test_token(&claims, "key-1", &signing_key());
    assert!(client.verify(&token).await.is_ok());
}

#[tokio::test]
async fn test_rotated_key_picked_up_on_refresh() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri())
        .await
        .unwrap()
        .with_min_refresh_interval(StdDuration::ZERO);

    server.reset().await;
    mount_jwks(&server, "key-2", Some(1)).await;

    let claims = oidc_claims(&server.uri(), "user1", true, Utc::now() + Duration::minutes(5));
    let token = sign_test_token(&claims, "key-2", &signing_key());
    let verified = client.verify(&token).await.unwrap();
    assert_eq!(verified.sub.as_deref(), Some("user1"));
    assert_eq!(client.key_count().await, 1);
}

#[tokio::test]
async fn test_garbage_token_rejected() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri()).await.unwrap();
    assert!(matches!(
        client.verify("not.a.jwt").await,
        Err(AuthError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn test_discovery_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    assert!(matches!(
        JwksClient::new(&server.uri()).await,
        Err(AuthError::JwksFetchError(_))
    ));
}

fn admin_reconciler(issuer: &str) -> Reconciler {
    Reconciler::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        &OidcConfig::for_issuer(issuer),
    )
}

#[tokio::test]
async fn test_admin_authentication_from_signed_token() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri()).await.unwrap();

    let mut claims = oidc_claims(&server.uri(), "root", true, Utc::now() + Duration::minutes(5));
    claims.roles = vec!["admin".to_string()];
    let token = sign_test_token(&claims, "key-1", &signing_key());

    let mut headers = http::HeaderMap::new();
    headers.insert("authorization", format!("Bearer {}", token).parse().unwrap());
    let verified = client.verify(bearer_token(&headers).unwrap()).await.unwrap();
    let user = admin_reconciler(&server.uri()).authorize_admin(verified).unwrap();
    assert_eq!(user.sub, "root");
    assert!(user.is_admin());
}

#[tokio::test]
async fn test_expired_admin_token_is_refused() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri()).await.unwrap();

    let mut claims = oidc_claims(&server.uri(), "root", true, Utc::now() - Duration::days(30));
    claims.roles = vec!["admin".to_string()];
    let token = sign_test_token(&claims, "key-1", &signing_key());

    // The signature is still good; the admin check is what refuses it.
    let verified = client.verify(&token).await.unwrap();
    assert!(matches!(
        admin_reconciler(&server.uri()).authorize_admin(verified),
        Err(ReconcileError::ExpiredToken(_))
    ));
}

#[tokio::test]
async fn test_admin_token_from_other_issuer_is_refused() {
    let server = provider("key-1").await;
    let client = JwksClient::new(&server.uri()).await.unwrap();

    let mut claims = oidc_claims(&server.uri(), "root", true, Utc::now() + Duration::minutes(5));
    claims.roles = vec!["admin".to_string()];
    let token = sign_test_token(&claims, "key-1", &signing_key());

    let verified = client.verify(&token).await.unwrap();
    assert!(matches!(
        admin_reconciler("https://idp.elsewhere").authorize_admin(verified),
        Err(ReconcileError::InvalidIssuer(_))
    ));
}
