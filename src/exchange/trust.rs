//! Trusted issuer registry: issuer → verification key by `kid`.
//!
//! # Key sources
//!
//! | Source | Lookup |
//! |--------|--------|
//! | Static | JWK Set given inline in config or loaded from a file at startup |
//! | Remote | `jwks_uri` fetched over HTTPS, cached (default 1 hour), refreshed once on unknown `kid` |
//! | Local | this service's own published key set, for re-exchanging issued tokens |
//!
//! A remote refresh triggered by an unknown `kid` is rate limited per issuer
//! so a stream of forged `kid` values cannot turn into a stream of fetches.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use tracing::{debug, warn};

use super::error::TokenError;
use super::jwk::{TrustedKey, find_trusted_key};
use super::keys::KeyManager;

/// Collaborator contract: resolve an issuer's verification key.
#[async_trait::async_trait]
pub trait IssuerRegistry: Send + Sync + 'static {
    /// Whether `issuer` is trusted at all, independent of any key.
    fn trusts(&self, issuer: &str) -> bool;

    /// Look up the key `kid` of `issuer`.
    ///
    /// Fails with [`TokenError::UntrustedIssuer`] for unknown issuers,
    /// [`TokenError::UnknownKey`] for unknown key ids and
    /// [`TokenError::IssuerUnavailable`] when the key source cannot be read.
    async fn resolve(&self, issuer: &str, kid: &str) -> Result<TrustedKey, TokenError>;
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Last failed fetch for an issuer.
struct FailedFetch {
    attempted_at: Instant,
    error: String,
}

/// JWKS cache, one entry per remote issuer.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    failures: DashMap<String, FailedFetch>,
    http: reqwest::Client,
    /// How long to cache a fetched JWKS.
    ttl: Duration,
    /// Minimum time between fetches for one issuer, whether forced by an
    /// unknown `kid` or retried after a failure.
    min_refresh: Duration,
}

impl JwksCache {
    /// Create a cache with the given TTL.
    ///
    /// Fails when the HTTPS client cannot be built.
    pub fn new(ttl: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            inner: DashMap::new(),
            failures: DashMap::new(),
            http,
            ttl,
            min_refresh: Duration::from_secs(30),
        })
    }

    /// Override the minimum interval between fetches for one issuer.
    #[must_use]
    pub fn with_min_refresh(mut self, min_refresh: Duration) -> Self {
        self.min_refresh = min_refresh;
        self
    }

    /// Return the cached JWKS for `issuer`, or fetch from `jwks_uri` if stale.
    ///
    /// `force_refresh` bypasses the TTL, but not the minimum refresh interval.
    /// A failed fetch is remembered for the same interval, so an unreachable
    /// issuer is not contacted on every request.
    pub async fn get_or_fetch(
        &self,
        issuer: &str,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, TokenError> {
        if let Some(cached) = self.inner.get(issuer) {
            let age = cached.fetched_at.elapsed();
            let fresh = age < self.ttl && !force_refresh;
            if fresh || (force_refresh && age < self.min_refresh) {
                return Ok(cached.keys.clone());
            }
        }

        if let Some(failed) = self.failures.get(issuer) {
            let since = failed.attempted_at.elapsed();
            if since < self.min_refresh {
                return Err(TokenError::IssuerUnavailable(format!(
                    "last fetch {}s ago failed: {}",
                    since.as_secs(),
                    failed.error
                )));
            }
        }

        debug!(issuer = %issuer, "Fetching JWKS from {jwks_uri}");
        let jwks = match self.fetch(jwks_uri).await {
            Ok(jwks) => jwks,
            Err(e) => {
                warn!(issuer = %issuer, error = %e, "JWKS fetch failed");
                self.failures.insert(
                    issuer.to_string(),
                    FailedFetch {
                        attempted_at: Instant::now(),
                        error: e.clone(),
                    },
                );
                return Err(TokenError::IssuerUnavailable(e));
            }
        };

        self.failures.remove(issuer);
        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(jwks)
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet, String> {
        self.http
            .get(jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }
}

impl fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksCache")
            .field("cached", &self.inner.len())
            .field("ttl", &self.ttl)
            .field("min_refresh", &self.min_refresh)
            .finish_non_exhaustive()
    }
}

/// Where an issuer's keys come from.
pub enum IssuerSource {
    /// Fixed JWK Set.
    Static(JwkSet),
    /// JWK Set document at a URL.
    Remote {
        /// `jwks_uri`
        jwks_uri: String,
    },
    /// This service's own key manager.
    Local(Arc<KeyManager>),
}

/// Registry built from configuration.
pub struct ConfiguredIssuerRegistry {
    issuers: HashMap<String, IssuerSource>,
    cache: JwksCache,
}

impl fmt::Debug for ConfiguredIssuerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut issuers: Vec<&str> = self.issuers.keys().map(String::as_str).collect();
        issuers.sort_unstable();
        f.debug_struct("ConfiguredIssuerRegistry")
            .field("issuers", &issuers)
            .field("cache", &self.cache)
            .finish()
    }
}

impl ConfiguredIssuerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(cache: JwksCache) -> Self {
        Self {
            issuers: HashMap::new(),
            cache,
        }
    }

    /// Trust `issuer` with a fixed JWK Set.
    #[must_use]
    pub fn with_static(mut self, issuer: impl Into<String>, jwks: JwkSet) -> Self {
        self.issuers.insert(issuer.into(), IssuerSource::Static(jwks));
        self
    }

    /// Trust `issuer` with keys fetched from `jwks_uri`.
    #[must_use]
    pub fn with_remote(mut self, issuer: impl Into<String>, jwks_uri: impl Into<String>) -> Self {
        let jwks_uri = jwks_uri.into();
        if !jwks_uri.starts_with("https://") {
            warn!(jwks_uri = %jwks_uri, "JWKS URI is not HTTPS, fetches will be refused");
        }
        self.issuers
            .insert(issuer.into(), IssuerSource::Remote { jwks_uri });
        self
    }

    /// Trust tokens this service issued itself.
    #[must_use]
    pub fn with_local(mut self, issuer: impl Into<String>, keys: Arc<KeyManager>) -> Self {
        self.issuers.insert(issuer.into(), IssuerSource::Local(keys));
        self
    }

    /// Number of trusted issuers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    /// `true` when no issuer is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    async fn resolve_remote(
        &self,
        issuer: &str,
        jwks_uri: &str,
        kid: &str,
    ) -> Result<TrustedKey, TokenError> {
        let jwks = self.cache.get_or_fetch(issuer, jwks_uri, false).await?;
        if let Some(key) = find_trusted_key(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.cache.get_or_fetch(issuer, jwks_uri, true).await?;
        find_trusted_key(&jwks, kid).ok_or_else(|| TokenError::UnknownKey(kid.to_string()))
    }
}

#[async_trait::async_trait]
impl IssuerRegistry for ConfiguredIssuerRegistry {
    fn trusts(&self, issuer: &str) -> bool {
        self.issuers.contains_key(issuer)
    }

    async fn resolve(&self, issuer: &str, kid: &str) -> Result<TrustedKey, TokenError> {
        let source = self
            .issuers
            .get(issuer)
            .ok_or_else(|| TokenError::UntrustedIssuer(issuer.to_string()))?;

        match source {
            IssuerSource::Static(jwks) => {
                find_trusted_key(jwks, kid).ok_or_else(|| TokenError::UnknownKey(kid.to_string()))
            }
            IssuerSource::Remote { jwks_uri } => self.resolve_remote(issuer, jwks_uri, kid).await,
            IssuerSource::Local(keys) => find_trusted_key(&keys.jwks(), kid)
                .ok_or_else(|| TokenError::UnknownKey(kid.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::keys::{KeyManagerSettings, KeyStatus, SigningAlgorithm, SigningKey};
    use crate::exchange::store::InMemoryKeyStore;
    use chrono::Utc;

    fn cache() -> JwksCache {
        JwksCache::new(Duration::from_secs(3600)).unwrap()
    }

    fn static_jwks() -> (String, JwkSet) {
        let key = SigningKey::generate(
            SigningAlgorithm::ES256,
            KeyStatus::Active,
            Utc::now(),
            Utc::now(),
        )
        .unwrap();
        let jwks = JwkSet {
            keys: vec![key.public_jwk().unwrap()],
        };
        (key.key_id, jwks)
    }

    #[tokio::test]
    async fn static_issuer_resolves_known_kid() {
        // GIVEN: a registry trusting one issuer with a static JWKS
        let (kid, jwks) = static_jwks();
        let registry = ConfiguredIssuerRegistry::new(cache())
            .with_static("https://idp.example.com", jwks);

        // WHEN/THEN: known kid resolves; unknown kid fails with UnknownKey
        let key = registry.resolve("https://idp.example.com", &kid).await.unwrap();
        assert_eq!(key.algorithm, SigningAlgorithm::ES256);
        assert_eq!(
            registry
                .resolve("https://idp.example.com", "nope")
                .await
                .unwrap_err(),
            TokenError::UnknownKey("nope".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_issuer_is_untrusted() {
        let registry = ConfiguredIssuerRegistry::new(cache());
        assert!(!registry.trusts("https://other.example"));
        let err = registry.resolve("https://other.example", "k").await.unwrap_err();
        assert!(matches!(err, TokenError::UntrustedIssuer(_)));
    }

    #[tokio::test]
    async fn local_issuer_follows_key_manager() {
        // GIVEN: a registry trusting the service's own key manager
        let km = Arc::new(KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            KeyManagerSettings::default(),
        ));
        km.initialize().await.unwrap();
        let kid = km.current_signing_key().unwrap().key_id;
        let registry = ConfiguredIssuerRegistry::new(cache())
            .with_local("https://sts.example.com", Arc::clone(&km));

        // THEN: the active key resolves
        assert!(registry.resolve("https://sts.example.com", &kid).await.is_ok());

        // WHEN: that key is revoked
        km.revoke(&kid).await.unwrap();

        // THEN: it no longer resolves
        assert!(matches!(
            registry.resolve("https://sts.example.com", &kid).await,
            Err(TokenError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn remote_fetch_refuses_plain_http() {
        // GIVEN: a remote issuer on a plain-HTTP URI
        let registry = ConfiguredIssuerRegistry::new(cache())
            .with_remote("https://idp.example.com", "http://127.0.0.1:9/jwks.json");

        // WHEN/THEN: the fetch is refused and surfaces as unavailable, not invalid
        let err = registry
            .resolve("https://idp.example.com", "kid")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::IssuerUnavailable(_)));
    }

    #[tokio::test]
    async fn failed_fetch_is_not_retried_within_min_refresh() {
        // GIVEN: a cache whose first fetch for an issuer failed
        let cache = cache();
        let first = cache
            .get_or_fetch("https://idp.example.com", "http://127.0.0.1:9/jwks.json", false)
            .await
            .unwrap_err();
        assert!(matches!(first, TokenError::IssuerUnavailable(_)));

        // WHEN: the issuer is asked for again right away, even forced
        let second = cache
            .get_or_fetch("https://idp.example.com", "http://127.0.0.1:9/jwks.json", true)
            .await
            .unwrap_err();

        // THEN: the remembered failure is returned without a new fetch
        let TokenError::IssuerUnavailable(detail) = second else {
            panic!("expected IssuerUnavailable, got {second:?}");
        };
        assert!(detail.starts_with("last fetch"), "{detail}");
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_after_min_refresh() {
        // GIVEN: a cache with no minimum refresh interval
        let cache = cache().with_min_refresh(Duration::ZERO);
        cache
            .get_or_fetch("https://idp.example.com", "http://127.0.0.1:9/jwks.json", false)
            .await
            .unwrap_err();

        // WHEN: asked again
        let again = cache
            .get_or_fetch("https://idp.example.com", "http://127.0.0.1:9/jwks.json", false)
            .await
            .unwrap_err();

        // THEN: a real fetch was attempted again
        let TokenError::IssuerUnavailable(detail) = again else {
            panic!("expected IssuerUnavailable, got {again:?}");
        };
        assert!(!detail.starts_with("last fetch"), "{detail}");
    }

    #[test]
    fn registry_debug_lists_issuers() {
        let (_, jwks) = static_jwks();
        let registry = ConfiguredIssuerRegistry::new(cache())
            .with_static("https://b.example", jwks.clone())
            .with_static("https://a.example", jwks);
        let debug = format!("{registry:?}");
        assert!(debug.contains(r#"["https://a.example", "https://b.example"]"#));
    }
}
