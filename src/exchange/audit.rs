//! Audit logging for token exchange and signing key lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator (Loki, CloudWatch, Datadog).
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | An exchange succeeded and a token was minted |
//! | `token.denied` | Policy refused the exchange |
//! | `token.invalid` | A subject or actor token failed verification |
//! | `request.malformed` | The request failed RFC 8693 structural validation |
//! | `exchange.unavailable` | Signing or a backend was unavailable |
//! | `key.created` | A new PENDING key was generated |
//! | `key.promoted` | A PENDING key became ACTIVE |
//! | `key.retired` | The previous ACTIVE key was demoted |
//! | `key.purged` | A RETIRED/REVOKED key reached the end of its retention |
//! | `key.revoked` | An operator revoked a key |

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::keys::SigningAlgorithm;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Subject of the exchanged token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Issuer of the subject token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_issuer: Option<String>,
    /// Actor subject, for delegated exchanges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Audience of the issued token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Granted scope (space-delimited).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// JWT ID of the issued token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Signing key id involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Replacement key id (for `key.revoked` of the ACTIVE key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement_key_id: Option<String>,
    /// Algorithm (for `key.created`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SigningAlgorithm>,
    /// Earliest promotion time (for `key.created`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Verification failure kind (for `token.invalid`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    /// Human-readable reason for denial or error events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            subject: None,
            subject_issuer: None,
            actor: None,
            audience: None,
            scope: None,
            token_jti: None,
            key_id: None,
            replacement_key_id: None,
            algorithm: None,
            not_before: None,
            kind: None,
            reason: None,
        }
    }

    /// Construct a `token.issued` event.
    #[must_use]
    pub fn issued(
        subject: &str,
        subject_issuer: &str,
        actor: Option<&str>,
        audience: &str,
        scope: &str,
        jti: &str,
        key_id: &str,
    ) -> Self {
        Self {
            subject: Some(subject.to_string()),
            subject_issuer: Some(subject_issuer.to_string()),
            actor: actor.map(str::to_string),
            audience: Some(audience.to_string()),
            scope: Some(scope.to_string()),
            token_jti: Some(jti.to_string()),
            key_id: Some(key_id.to_string()),
            ..Self::bare("token.issued")
        }
    }

    /// Construct a `token.denied` event (policy refusal).
    #[must_use]
    pub fn denied(subject: &str, subject_issuer: &str, reason: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.to_string()),
            subject_issuer: Some(subject_issuer.to_string()),
            reason: Some(reason.into()),
            ..Self::bare("token.denied")
        }
    }

    /// Construct a `token.invalid` event (verification failure).
    #[must_use]
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            reason: Some(reason.into()),
            ..Self::bare("token.invalid")
        }
    }

    /// Construct a `request.malformed` event.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare("request.malformed")
        }
    }

    /// Construct an `exchange.unavailable` event. The reason is internal text
    /// and only ever reaches the log.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare("exchange.unavailable")
        }
    }

    /// Construct a `key.created` event.
    #[must_use]
    pub fn key_created(
        key_id: &str,
        algorithm: SigningAlgorithm,
        not_before: DateTime<Utc>,
    ) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
            algorithm: Some(algorithm),
            not_before: Some(not_before),
            ..Self::bare("key.created")
        }
    }

    /// Construct a `key.promoted` event.
    #[must_use]
    pub fn key_promoted(key_id: &str) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
            ..Self::bare("key.promoted")
        }
    }

    /// Construct a `key.retired` event.
    #[must_use]
    pub fn key_retired(key_id: &str) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
            ..Self::bare("key.retired")
        }
    }

    /// Construct a `key.purged` event.
    #[must_use]
    pub fn key_purged(key_id: &str) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
            ..Self::bare("key.purged")
        }
    }

    /// Construct a `key.revoked` event.
    #[must_use]
    pub fn key_revoked(key_id: &str, replacement: Option<&str>) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
            replacement_key_id: replacement.map(str::to_string),
            ..Self::bare("key.revoked")
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// The event is serialized as a JSON blob in the `audit` field:
///
/// ```text
/// INFO sts::exchange::audit audit={"event":"token.issued","subject":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "sts audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
