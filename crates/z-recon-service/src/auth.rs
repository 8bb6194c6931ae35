//! Authentication capabilities and extractors.
//!
//! Handlers never look at credentials themselves. The application state
//! carries two injected capabilities:
//!
//! - [`IdentityResolver`]: who is calling (ZID JWT by default)
//! - [`AdminResolver`]: whether the caller may use admin endpoints
//!   (`X-Admin-Key` by default)
//!
//! and the extractors below ask them:
//!
//! - `AuthIdentity` - any authenticated identity
//! - `AuthCustomer` - an authenticated identity with a provisioned customer
//! - `AuthAdmin` - the admin capability

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use z_recon_core::Customer;
use z_recon_store::Store;

use crate::config::ServiceConfig;
use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Constants
// ============================================================================

/// How long to cache JWKS keys before refreshing.
const JWKS_CACHE_DURATION: Duration = Duration::from_secs(3600); // 1 hour

/// Timeout for JWKS fetch requests.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject of the identity token.
    pub subject: String,
    /// Email claim, when the token carries one.
    pub email: Option<String>,
}

/// A caller holding the admin capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admin {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

/// Resolves the calling identity from request headers.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The identity behind the request, or `ApiError::Unauthorized`.
    async fn resolve_identity(&self, parts: &Parts) -> Result<Identity, ApiError>;
}

/// Decides whether the caller holds the admin capability.
#[async_trait]
pub trait AdminResolver: Send + Sync {
    /// The admin behind the request, or `ApiError::Unauthorized`.
    async fn resolve_admin(&self, parts: &Parts) -> Result<Admin, ApiError>;
}

// ============================================================================
// Extractors
// ============================================================================

/// Any authenticated identity.
#[derive(Debug, Clone)]
pub struct AuthIdentity(pub Identity);

impl FromRequestParts<Arc<AppState>> for AuthIdentity {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let identity = state.identity.resolve_identity(parts).await?;
            Ok(AuthIdentity(identity))
        })
    }
}

/// An authenticated identity with its provisioned customer.
#[derive(Debug, Clone)]
pub struct AuthCustomer {
    /// The caller.
    pub identity: Identity,
    /// The caller's customer record.
    pub customer: Customer,
}

impl FromRequestParts<Arc<AppState>> for AuthCustomer {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let identity = state.identity.resolve_identity(parts).await?;

            let customer = state
                .store
                .find_customer_by_identity(&identity.subject)?
                .ok_or_else(|| ApiError::NotFound("Customer not provisioned".into()))?;

            Ok(AuthCustomer { identity, customer })
        })
    }
}

/// The admin capability.
#[derive(Debug, Clone)]
pub struct AuthAdmin(pub Admin);

impl FromRequestParts<Arc<AppState>> for AuthAdmin {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let admin = state.admin.resolve_admin(parts).await?;
            Ok(AuthAdmin(admin))
        })
    }
}

// ============================================================================
// Admin key resolver
// ============================================================================

/// Admin capability via the `X-Admin-Key` header.
///
/// With no key configured every request is refused.
#[derive(Debug, Clone)]
pub struct AdminKeyResolver {
    key: Option<String>,
}

impl AdminKeyResolver {
    /// Create a resolver accepting `key`.
    #[must_use]
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }
}

#[async_trait]
impl AdminResolver for AdminKeyResolver {
    async fn resolve_admin(&self, parts: &Parts) -> Result<Admin, ApiError> {
        let admin_key = parts
            .headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let expected_key = self.key.as_ref().ok_or(ApiError::Unauthorized)?;

        if !constant_time_eq(admin_key, expected_key) {
            return Err(ApiError::Unauthorized);
        }

        // Extract admin identifier from header if provided
        let admin_id = parts
            .headers
            .get("x-admin-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("admin")
            .to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(Admin { admin_id })
    }
}

// ============================================================================
// JWKS Client and JWT Validation
// ============================================================================

/// JWT claims structure for ZID tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Audience (can be string or array).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Issuer.
    pub iss: String,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    pub iat: i64,
    /// Email, when the token carries it.
    #[serde(default)]
    pub email: Option<String>,
}

/// JWKS (JSON Web Key Set) response structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    /// List of JWK keys.
    pub keys: Vec<Jwk>,
}

/// Single JSON Web Key.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA").
    pub kty: String,
    /// Key ID.
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256").
    pub alg: Option<String>,
    /// RSA public key modulus (base64url encoded).
    pub n: Option<String>,
    /// RSA public key exponent (base64url encoded).
    pub e: Option<String>,
    /// Key use (e.g., "sig" for signature).
    #[serde(rename = "use")]
    pub key_use: Option<String>,
}

struct JwksCache {
    /// Cached keys mapped by kid.
    keys: HashMap<String, DecodingKey>,
    /// Default key (for tokens without kid).
    default_key: Option<DecodingKey>,
    /// When the cache was last updated.
    last_updated: Instant,
}

impl JwksCache {
    fn new() -> Self {
        Self {
            keys: HashMap::new(),
            default_key: None,
            // Force the first lookup to fetch.
            last_updated: Instant::now()
                .checked_sub(JWKS_CACHE_DURATION)
                .unwrap_or_else(Instant::now),
        }
    }

    fn is_expired(&self) -> bool {
        self.last_updated.elapsed() >= JWKS_CACHE_DURATION
    }

    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        match kid {
            Some(kid) => self.keys.get(kid).cloned(),
            None => self.default_key.clone(),
        }
    }
}

/// Identity from a ZID bearer token validated against the issuer's JWKS.
pub struct JwksIdentityResolver {
    client: reqwest::Client,
    base_url: String,
    audience: String,
    cache: RwLock<JwksCache>,
}

impl JwksIdentityResolver {
    /// Create a resolver for tokens issued by `base_url` for `audience`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, audience: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            audience: audience.into(),
            cache: RwLock::new(JwksCache::new()),
        }
    }

    /// Create the resolver described by the configuration.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(&config.auth_base_url, &config.auth_audience)
    }

    /// Validate a JWT token against the JWKS.
    async fn validate_jwt(&self, token: &str) -> Result<JwtClaims, ApiError> {
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "Failed to decode JWT header");
            ApiError::Unauthorized
        })?;

        let decoding_key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.base_url]);

        let token_data = decode::<JwtClaims>(token, &decoding_key, &validation).map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            ApiError::Unauthorized
        })?;

        Ok(token_data.claims)
    }

    /// Get a decoding key from cache or fetch from JWKS endpoint.
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, ApiError> {
        {
            let cache = self.cache.read().await;
            if !cache.is_expired() {
                if let Some(key) = cache.lookup(kid) {
                    return Ok(key);
                }
            }
        }

        // Cache miss or expired - fetch JWKS
        let jwks = self.fetch_jwks().await?;

        let mut cache = self.cache.write().await;
        cache.keys.clear();
        cache.default_key = None;
        cache.last_updated = Instant::now();

        for jwk in &jwks.keys {
            if let Some(decoding_key) = jwk_to_decoding_key(jwk) {
                if let Some(ref key_kid) = jwk.kid {
                    cache.keys.insert(key_kid.clone(), decoding_key.clone());
                }
                if cache.default_key.is_none() {
                    cache.default_key = Some(decoding_key);
                }
            }
        }

        cache.lookup(kid).ok_or(ApiError::Unauthorized)
    }

    async fn fetch_jwks(&self) -> Result<Jwks, ApiError> {
        let jwks_url = format!("{}/.well-known/jwks.json", self.base_url);

        tracing::debug!(url = %jwks_url, "Fetching JWKS");

        let response = self.client.get(&jwks_url).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %jwks_url, "Failed to fetch JWKS");
            ApiError::ExternalService("Failed to fetch authentication keys".into())
        })?;

        if !response.status().is_success() {
            tracing::error!(
                status = %response.status(),
                url = %jwks_url,
                "JWKS fetch returned non-success status"
            );
            return Err(ApiError::ExternalService(
                "Failed to fetch authentication keys".into(),
            ));
        }

        let jwks: Jwks = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JWKS response");
            ApiError::ExternalService("Failed to parse authentication keys".into())
        })?;

        tracing::info!(keys_count = %jwks.keys.len(), "JWKS fetched successfully");

        Ok(jwks)
    }
}

#[async_trait]
impl IdentityResolver for JwksIdentityResolver {
    async fn resolve_identity(&self, parts: &Parts) -> Result<Identity, ApiError> {
        let token = bearer_token(parts).ok_or(ApiError::Unauthorized)?;
        let claims = self.validate_jwt(token).await?;

        Ok(Identity {
            subject: claims.sub,
            email: claims.email,
        })
    }
}

/// The bearer token from the `Authorization` header.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Convert a JWK to a `DecodingKey`.
fn jwk_to_decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    // Only support RSA keys for now
    if jwk.kty != "RSA" {
        tracing::debug!(kty = %jwk.kty, "Skipping non-RSA JWK");
        return None;
    }

    let n = jwk.n.as_ref()?;
    let e = jwk.e.as_ref()?;

    DecodingKey::from_rsa_components(n, e).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/v1/me/orders");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn admin_key_must_match() {
        let resolver = AdminKeyResolver::new(Some("secret".into()));

        let admin = resolver
            .resolve_admin(&parts(&[("x-admin-key", "secret"), ("x-admin-id", "ops")]))
            .await
            .unwrap();
        assert_eq!(admin.admin_id, "ops");

        assert!(resolver
            .resolve_admin(&parts(&[("x-admin-key", "guess")]))
            .await
            .is_err());
        assert!(resolver.resolve_admin(&parts(&[])).await.is_err());
    }

    #[tokio::test]
    async fn no_admin_key_refuses_everyone() {
        let resolver = AdminKeyResolver::new(None);
        assert!(resolver
            .resolve_admin(&parts(&[("x-admin-key", "")]))
            .await
            .is_err());
    }

    #[test]
    fn bearer_token_is_extracted() {
        assert_eq!(
            bearer_token(&parts(&[("authorization", "Bearer abc.def")])),
            Some("abc.def")
        );
        assert_eq!(bearer_token(&parts(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&parts(&[("authorization", "Bearer ")])), None);
    }

    #[test]
    fn non_rsa_keys_are_skipped() {
        let jwk = Jwk {
            kty: "EC".into(),
            kid: Some("k1".into()),
            alg: Some("ES256".into()),
            n: None,
            e: None,
            key_use: Some("sig".into()),
        };
        assert!(jwk_to_decoding_key(&jwk).is_none());
    }

    #[tokio::test]
    async fn garbage_tokens_are_unauthorized_without_fetching() {
        let resolver = JwksIdentityResolver::new("http://127.0.0.1:9", "z-recon");
        let err = resolver
            .resolve_identity(&parts(&[("authorization", "Bearer not-a-jwt")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }
}
