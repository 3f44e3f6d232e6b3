//! Signing key lifecycle: generation, rotation, publication and revocation.
//!
//! # Lifecycle
//!
//! ```text
//! rotate()            tick() after grace        tick() after retention
//!    │                      │                          │
//!    ▼                      ▼                          ▼
//! PENDING ──────────────► ACTIVE ───(next promotion)─► RETIRED ──► purged
//!    │                      │                          │
//!    └──────── revoke() ────┴──────────────────────────┴──► REVOKED (unpublished)
//! ```
//!
//! # Concurrency
//!
//! The key set is held as an immutable, versioned [`KeySet`] snapshot behind
//! a `parking_lot::RwLock<Arc<_>>`. Readers clone the `Arc` and release the
//! lock immediately, so they always see a complete set as of one instant.
//! Writers serialize on an async mutex and follow the same three steps:
//! compute the next set, commit the delta to the [`KeyStore`], then swap the
//! snapshot. A failing commit returns before the swap.
//!
//! The manager never schedules itself. The server drives [`KeyManager::tick`]
//! and [`KeyManager::rotate`] from timers; operators call them through the
//! admin endpoints.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::EncodingKey;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use parking_lot::RwLock;
use rcgen::PublicKeyData;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::audit::{self, AuditEvent};
use super::jwk;
use super::store::{KeyChanges, KeyStore, KeyStoreError};

/// Error variants for key lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// No key is ACTIVE yet (startup before the first promotion).
    #[error("no active signing key")]
    NoActiveKey,

    /// The referenced key id is not in the key set.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Key pair generation failed (entropy or crypto backend).
    #[error("key generation failed: {0}")]
    Generation(String),

    /// Stored key material could not be decoded.
    #[error("invalid key material: {0}")]
    InvalidMaterial(String),

    /// The key store rejected the transition.
    #[error(transparent)]
    Store(#[from] KeyStoreError),
}

/// Signature algorithms the service can sign and verify with.
///
/// A closed set: every other JWS `alg` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// ECDSA P-256 with SHA-256.
    #[default]
    ES256,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RS256,
}

impl SigningAlgorithm {
    /// The `jsonwebtoken` algorithm used for signing and verification.
    #[must_use]
    pub fn jwt_algorithm(self) -> jsonwebtoken::Algorithm {
        match self {
            Self::ES256 => jsonwebtoken::Algorithm::ES256,
            Self::RS256 => jsonwebtoken::Algorithm::RS256,
        }
    }

    /// Map a JWS header `alg` onto the supported set.
    #[must_use]
    pub fn from_jwt_algorithm(alg: jsonwebtoken::Algorithm) -> Option<Self> {
        match alg {
            jsonwebtoken::Algorithm::ES256 => Some(Self::ES256),
            jsonwebtoken::Algorithm::RS256 => Some(Self::RS256),
            _ => None,
        }
    }

    /// The `rcgen` algorithm used to generate key pairs.
    #[must_use]
    pub fn key_generation_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::ES256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::RS256 => &rcgen::PKCS_RSA_SHA256,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ES256 => f.write_str("ES256"),
            Self::RS256 => f.write_str("RS256"),
        }
    }
}

/// Lifecycle status of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Published, not yet used for signing.
    Pending,
    /// The current signing key.
    Active,
    /// Published for verification of already-issued tokens until `not_after`.
    Retired,
    /// Withdrawn after compromise. Never published.
    Revoked,
}

/// PKCS#8 PEM private key bytes. `Debug` never prints the material.
#[derive(Clone)]
pub struct SecretMaterial(Vec<u8>);

impl SecretMaterial {
    /// Wrap raw PEM bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial(<redacted>)")
    }
}

/// A signing key pair with lifecycle metadata.
#[derive(Debug, Clone)]
pub struct SigningKey {
    /// RFC 7638 thumbprint of the public key.
    pub key_id: String,
    /// Signature algorithm.
    pub algorithm: SigningAlgorithm,
    /// PKCS#8 PEM private key.
    pub private_material: SecretMaterial,
    /// DER `SubjectPublicKeyInfo`.
    pub public_material: Vec<u8>,
    /// Lifecycle status.
    pub status: KeyStatus,
    /// Generation time.
    pub created_at: DateTime<Utc>,
    /// Earliest promotion time for a PENDING key.
    pub not_before: DateTime<Utc>,
    /// End of publication, set on retirement or revocation.
    pub not_after: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Generate a fresh key pair.
    pub fn generate(
        algorithm: SigningAlgorithm,
        status: KeyStatus,
        created_at: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<Self, KeyError> {
        let key_pair = rcgen::KeyPair::generate_for(algorithm.key_generation_algorithm())
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let public_material = key_pair.subject_public_key_info();
        let key_id = jwk::thumbprint(algorithm, &public_material)?;

        Ok(Self {
            key_id,
            algorithm,
            private_material: SecretMaterial::new(key_pair.serialize_pem().into_bytes()),
            public_material,
            status,
            created_at,
            not_before,
            not_after: None,
        })
    }

    /// Build the `jsonwebtoken` signing key.
    pub fn encoding_key(&self) -> Result<EncodingKey, KeyError> {
        let pem = self.private_material.expose();
        match self.algorithm {
            SigningAlgorithm::ES256 => EncodingKey::from_ec_pem(pem),
            SigningAlgorithm::RS256 => EncodingKey::from_rsa_pem(pem),
        }
        .map_err(|e| KeyError::InvalidMaterial(e.to_string()))
    }

    /// Public JWK for this key.
    pub fn public_jwk(&self) -> Result<Jwk, KeyError> {
        jwk::public_jwk(&self.key_id, self.algorithm, &self.public_material)
    }

    /// Whether this key belongs in the published set at `now`.
    #[must_use]
    pub fn is_published_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            KeyStatus::Active | KeyStatus::Pending => true,
            KeyStatus::Retired => self.not_after.is_none_or(|end| end > now),
            KeyStatus::Revoked => false,
        }
    }

    fn is_purgeable_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, KeyStatus::Retired | KeyStatus::Revoked)
            && self.not_after.is_some_and(|end| end <= now)
    }
}

/// Source of fresh key pairs for a [`KeyManager`].
pub trait KeyGenerator: Send + Sync + 'static {
    /// Generate one key pair with the given lifecycle metadata.
    fn generate(
        &self,
        algorithm: SigningAlgorithm,
        status: KeyStatus,
        created_at: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<SigningKey, KeyError>;
}

/// [`KeyGenerator`] backed by [`SigningKey::generate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenKeyGenerator;

impl KeyGenerator for RcgenKeyGenerator {
    fn generate(
        &self,
        algorithm: SigningAlgorithm,
        status: KeyStatus,
        created_at: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<SigningKey, KeyError> {
        SigningKey::generate(algorithm, status, created_at, not_before)
    }
}

/// A public key as published in the discovery document.
#[derive(Debug, Clone)]
pub struct PublishedKey {
    /// Key id (`kid`).
    pub key_id: String,
    /// Signature algorithm.
    pub algorithm: SigningAlgorithm,
    /// Lifecycle status at snapshot time.
    pub status: KeyStatus,
    /// DER `SubjectPublicKeyInfo`.
    pub public_material: Vec<u8>,
}

impl PublishedKey {
    /// Public JWK for this key.
    pub fn to_jwk(&self) -> Result<Jwk, KeyError> {
        jwk::public_jwk(&self.key_id, self.algorithm, &self.public_material)
    }
}

/// Immutable, versioned snapshot of the key set.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    version: u64,
    keys: Vec<SigningKey>,
}

impl KeySet {
    fn new(version: u64, keys: Vec<SigningKey>) -> Self {
        Self { version, keys }
    }

    /// Monotonic version, bumped on every committed transition.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All keys, including revoked ones.
    #[must_use]
    pub fn keys(&self) -> &[SigningKey] {
        &self.keys
    }

    /// The ACTIVE key, if any.
    #[must_use]
    pub fn active(&self) -> Option<&SigningKey> {
        self.keys.iter().find(|k| k.status == KeyStatus::Active)
    }

    /// The oldest PENDING key, if any.
    #[must_use]
    pub fn pending(&self) -> Option<&SigningKey> {
        self.keys
            .iter()
            .filter(|k| k.status == KeyStatus::Pending)
            .min_by_key(|k| k.created_at)
    }

    /// Published keys at `now`: ACTIVE, then PENDING, then RETIRED newest first.
    #[must_use]
    pub fn published(&self, now: DateTime<Utc>) -> Vec<PublishedKey> {
        let rank = |status: KeyStatus| match status {
            KeyStatus::Active => 0,
            KeyStatus::Pending => 1,
            KeyStatus::Retired | KeyStatus::Revoked => 2,
        };

        let mut keys: Vec<&SigningKey> = self
            .keys
            .iter()
            .filter(|k| k.is_published_at(now))
            .collect();
        keys.sort_by(|a, b| {
            rank(a.status)
                .cmp(&rank(b.status))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        keys.into_iter()
            .map(|k| PublishedKey {
                key_id: k.key_id.clone(),
                algorithm: k.algorithm,
                status: k.status,
                public_material: k.public_material.clone(),
            })
            .collect()
    }

    fn position(&self, key_id: &str) -> Option<usize> {
        self.keys.iter().position(|k| k.key_id == key_id)
    }
}

/// Key lifecycle timing.
#[derive(Debug, Clone)]
pub struct KeyManagerSettings {
    /// Algorithm for newly generated keys.
    pub algorithm: SigningAlgorithm,
    /// Time a PENDING key is published before it may be promoted.
    pub grace_period: Duration,
    /// Time a RETIRED (or REVOKED) key record is kept after demotion.
    pub retired_retention: Duration,
}

impl Default for KeyManagerSettings {
    fn default() -> Self {
        Self {
            algorithm: SigningAlgorithm::ES256,
            grace_period: Duration::from_secs(300),
            retired_retention: Duration::from_secs(2 * 3600),
        }
    }
}

/// Result of a [`KeyManager::tick`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Key promoted from PENDING to ACTIVE.
    pub promoted: Option<String>,
    /// Key demoted from ACTIVE to RETIRED.
    pub retired: Option<String>,
    /// Keys removed after their retention elapsed.
    pub purged: Vec<String>,
}

impl TickOutcome {
    /// `true` when the tick changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.promoted.is_none() && self.retired.is_none() && self.purged.is_empty()
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Owns the signing key set.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    generator: Arc<dyn KeyGenerator>,
    settings: KeyManagerSettings,
    snapshot: RwLock<Arc<KeySet>>,
    writer: tokio::sync::Mutex<()>,
}

impl KeyManager {
    /// Create a manager with an empty key set. Call [`initialize`](Self::initialize)
    /// before serving.
    #[must_use]
    pub fn new(store: Arc<dyn KeyStore>, settings: KeyManagerSettings) -> Self {
        Self {
            store,
            generator: Arc::new(RcgenKeyGenerator),
            settings,
            snapshot: RwLock::new(Arc::new(KeySet::default())),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the key pair generator.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Lifecycle settings.
    #[must_use]
    pub fn settings(&self) -> &KeyManagerSettings {
        &self.settings
    }

    /// Current snapshot of the whole key set.
    #[must_use]
    pub fn snapshot(&self) -> Arc<KeySet> {
        Arc::clone(&self.snapshot.read())
    }

    fn publish(&self, set: KeySet) {
        *self.snapshot.write() = Arc::new(set);
    }

    /// `true` once an ACTIVE key exists.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.snapshot().active().is_some()
    }

    /// The ACTIVE signing key.
    pub fn current_signing_key(&self) -> Result<SigningKey, KeyError> {
        self.snapshot().active().cloned().ok_or(KeyError::NoActiveKey)
    }

    /// Published public keys (ACTIVE, PENDING, unexpired RETIRED).
    #[must_use]
    pub fn public_key_set(&self) -> Vec<PublishedKey> {
        self.public_key_set_at(Utc::now())
    }

    /// [`public_key_set`](Self::public_key_set) evaluated at `now`.
    #[must_use]
    pub fn public_key_set_at(&self, now: DateTime<Utc>) -> Vec<PublishedKey> {
        self.snapshot().published(now)
    }

    /// The published key set as a JWK Set document.
    #[must_use]
    pub fn jwks(&self) -> JwkSet {
        self.jwks_at(Utc::now())
    }

    /// [`jwks`](Self::jwks) evaluated at `now`.
    #[must_use]
    pub fn jwks_at(&self, now: DateTime<Utc>) -> JwkSet {
        let keys = self
            .public_key_set_at(now)
            .iter()
            .filter_map(|k| match k.to_jwk() {
                Ok(jwk) => Some(jwk),
                Err(e) => {
                    warn!(kid = %k.key_id, error = %e, "Skipping unpublishable key");
                    None
                }
            })
            .collect();
        JwkSet { keys }
    }

    /// Load the key set from the store and make sure an ACTIVE key exists.
    pub async fn initialize(&self) -> Result<(), KeyError> {
        self.initialize_at(Utc::now()).await
    }

    /// [`initialize`](Self::initialize) evaluated at `now`.
    pub async fn initialize_at(&self, now: DateTime<Utc>) -> Result<(), KeyError> {
        {
            let _guard = self.writer.lock().await;
            let mut keys = self.store.load().await?;

            // A store holding several ACTIVE records (crash mid-transition in
            // a non-atomic backend) keeps the newest and retires the rest.
            keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let mut repairs = KeyChanges::default();
            let mut seen_active = false;
            for key in &mut keys {
                if key.status == KeyStatus::Active {
                    if seen_active {
                        key.status = KeyStatus::Retired;
                        key.not_after = Some(now + delta(self.settings.retired_retention));
                        warn!(kid = %key.key_id, "Demoting duplicate active key");
                        repairs.upserts.push(key.clone());
                    }
                    seen_active = true;
                }
            }
            if !repairs.is_empty() {
                self.store.commit(repairs).await?;
            }

            let version = self.snapshot().version() + 1;
            info!(keys = keys.len(), active = seen_active, "Loaded signing keys");
            self.publish(KeySet::new(version, keys));
        }

        if !self.is_ready() {
            info!("No active signing key, bootstrapping");
            self.rotate_at(now).await?;
            self.tick_at(now).await?;
        }
        Ok(())
    }

    async fn generate(
        &self,
        status: KeyStatus,
        created_at: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<SigningKey, KeyError> {
        let algorithm = self.settings.algorithm;
        let generator = Arc::clone(&self.generator);
        // RSA generation takes long enough to stall a runtime worker.
        tokio::task::spawn_blocking(move || {
            generator.generate(algorithm, status, created_at, not_before)
        })
        .await
        .map_err(|e| KeyError::Generation(e.to_string()))?
    }

    /// Generate a new PENDING key; returns its id.
    ///
    /// When a PENDING key already exists the call changes nothing and returns
    /// that key's id.
    pub async fn rotate(&self) -> Result<String, KeyError> {
        self.rotate_at(Utc::now()).await
    }

    /// [`rotate`](Self::rotate) evaluated at `now`.
    pub async fn rotate_at(&self, now: DateTime<Utc>) -> Result<String, KeyError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot();

        if let Some(pending) = current.pending() {
            debug!(kid = %pending.key_id, "Rotation already pending");
            return Ok(pending.key_id.clone());
        }

        let not_before = now + delta(self.settings.grace_period);
        let key = match self.generate(KeyStatus::Pending, now, not_before).await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Key generation failed, keeping current key set");
                return Err(e);
            }
        };
        let key_id = key.key_id.clone();

        self.store
            .commit(KeyChanges {
                upserts: vec![key.clone()],
                removals: Vec::new(),
            })
            .await?;

        let mut keys = current.keys().to_vec();
        keys.push(key);
        self.publish(KeySet::new(current.version() + 1, keys));

        audit::emit(&AuditEvent::key_created(&key_id, self.settings.algorithm, not_before));
        Ok(key_id)
    }

    /// Perform at most one promotion and purge expired keys.
    ///
    /// Promotes the oldest PENDING key whose grace period has elapsed, or any
    /// PENDING key while no key is ACTIVE.
    pub async fn tick(&self) -> Result<TickOutcome, KeyError> {
        self.tick_at(Utc::now()).await
    }

    /// [`tick`](Self::tick) evaluated at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome, KeyError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot();
        let mut outcome = TickOutcome::default();
        let mut changes = KeyChanges::default();

        let mut keys: Vec<SigningKey> = Vec::with_capacity(current.keys().len());
        for key in current.keys() {
            if key.is_purgeable_at(now) {
                outcome.purged.push(key.key_id.clone());
                changes.removals.push(key.key_id.clone());
            } else {
                keys.push(key.clone());
            }
        }

        let active_idx = keys.iter().position(|k| k.status == KeyStatus::Active);
        let candidate = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| {
                k.status == KeyStatus::Pending && (active_idx.is_none() || k.not_before <= now)
            })
            .min_by_key(|(_, k)| k.created_at)
            .map(|(i, _)| i);

        if let Some(idx) = candidate {
            if let Some(active) = active_idx {
                let old = &mut keys[active];
                old.status = KeyStatus::Retired;
                old.not_after = Some(now + delta(self.settings.retired_retention));
                outcome.retired = Some(old.key_id.clone());
                changes.upserts.push(old.clone());
            }
            let new = &mut keys[idx];
            new.status = KeyStatus::Active;
            outcome.promoted = Some(new.key_id.clone());
            changes.upserts.push(new.clone());
        }

        if changes.is_empty() {
            return Ok(outcome);
        }

        self.store.commit(changes).await?;
        self.publish(KeySet::new(current.version() + 1, keys));

        if let Some(ref kid) = outcome.promoted {
            audit::emit(&AuditEvent::key_promoted(kid));
        }
        if let Some(ref kid) = outcome.retired {
            audit::emit(&AuditEvent::key_retired(kid));
        }
        for kid in &outcome.purged {
            audit::emit(&AuditEvent::key_purged(kid));
        }
        Ok(outcome)
    }

    /// Revoke a key immediately and remove it from the published set.
    ///
    /// Revoking the ACTIVE key promotes the oldest PENDING key in the same
    /// transition, or generates a replacement directly as ACTIVE. If no
    /// replacement can be produced the revocation fails and nothing changes.
    pub async fn revoke(&self, key_id: &str) -> Result<(), KeyError> {
        self.revoke_at(key_id, Utc::now()).await
    }

    /// [`revoke`](Self::revoke) evaluated at `now`.
    pub async fn revoke_at(&self, key_id: &str, now: DateTime<Utc>) -> Result<(), KeyError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot();
        let idx = current
            .position(key_id)
            .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;

        let mut keys = current.keys().to_vec();
        if keys[idx].status == KeyStatus::Revoked {
            return Ok(());
        }

        let was_active = keys[idx].status == KeyStatus::Active;
        let revoked = &mut keys[idx];
        revoked.status = KeyStatus::Revoked;
        revoked.not_after = Some(now + delta(self.settings.retired_retention));
        let mut changes = KeyChanges {
            upserts: vec![revoked.clone()],
            removals: Vec::new(),
        };

        let mut replacement = None;
        if was_active {
            let pending = keys
                .iter()
                .enumerate()
                .filter(|(_, k)| k.status == KeyStatus::Pending)
                .min_by_key(|(_, k)| k.created_at)
                .map(|(i, _)| i);

            if let Some(p) = pending {
                keys[p].status = KeyStatus::Active;
                changes.upserts.push(keys[p].clone());
                replacement = Some(keys[p].key_id.clone());
            } else {
                let key = self.generate(KeyStatus::Active, now, now).await?;
                replacement = Some(key.key_id.clone());
                changes.upserts.push(key.clone());
                keys.push(key);
            }
        }

        self.store.commit(changes).await?;
        self.publish(KeySet::new(current.version() + 1, keys));

        audit::emit(&AuditEvent::key_revoked(key_id, replacement.as_deref()));
        Ok(())
    }
}
