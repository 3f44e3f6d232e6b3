//! Subject and actor token verification.
//!
//! A presented token is checked in a fixed order, and the first failing step
//! decides the error:
//!
//! 1. structure: three base64url segments, JSON header and payload, string
//!    `iss` and `sub`, numeric `exp`
//! 2. issuer and key: the unverified `iss` selects the issuer, header `kid`
//!    selects the key
//! 3. signature, with the algorithm bound to the key
//! 4. `exp` / `nbf` with a clock-skew allowance
//! 5. declared token type against header `typ`
//!
//! Nothing from the payload is trusted before step 3 passes. The unverified
//! `iss` only picks which keys to try.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::Validation;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::error::{TokenError, TokenUse};
use super::keys::SigningAlgorithm;
use super::request::TokenType;
use super::trust::IssuerRegistry;

/// Claims of a token that passed every verification step. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    /// `iss`
    pub issuer: String,
    /// `sub`
    pub subject: String,
    /// `aud`, string or array form.
    pub audience: BTreeSet<String>,
    /// `scope` (space-delimited) or `scp` (array).
    pub scope: BTreeSet<String>,
    /// `exp`
    pub expires_at: DateTime<Utc>,
    /// `iat`, when present.
    pub issued_at: Option<DateTime<Utc>>,
    /// Declared token type the token was checked against.
    pub token_type: TokenType,
    /// Header `kid` of the key that verified the signature.
    pub key_id: String,
    /// Full payload.
    pub raw: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    typ: Option<String>,
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, TokenError> {
    if segment.is_empty() {
        return Err(TokenError::MalformedToken(format!("empty {what} segment")));
    }
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::MalformedToken(format!("{what} is not base64url")))
}

/// Seconds since the epoch, from an integer or a JSON number with a fraction.
#[allow(clippy::cast_possible_truncation)]
fn numeric_date(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f.floor() as i64)
    })
}

fn timestamp(secs: i64, claim: &str) -> Result<DateTime<Utc>, TokenError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| TokenError::MalformedToken(format!("{claim} out of range")))
}

fn string_claim(payload: &Map<String, Value>, claim: &str) -> Result<String, TokenError> {
    match payload.get(claim) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(TokenError::MalformedToken(format!("{claim} must be a string"))),
        None => Err(TokenError::MalformedToken(format!("missing {claim}"))),
    }
}

fn audience_set(payload: &Map<String, Value>) -> BTreeSet<String> {
    match payload.get("aud") {
        Some(Value::String(s)) => BTreeSet::from([s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn scope_set(payload: &Map<String, Value>) -> BTreeSet<String> {
    match (payload.get("scope"), payload.get("scp")) {
        (Some(Value::String(s)), _) => s.split_whitespace().map(str::to_string).collect(),
        (_, Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        (_, Some(Value::String(s))) => s.split_whitespace().map(str::to_string).collect(),
        _ => BTreeSet::new(),
    }
}

/// Verifies subject and actor tokens against the trusted issuer registry.
pub struct TokenVerifier {
    registry: Arc<dyn IssuerRegistry>,
    clock_skew: Duration,
}

impl TokenVerifier {
    /// Create a verifier with the given clock-skew allowance.
    #[must_use]
    pub fn new(registry: Arc<dyn IssuerRegistry>, clock_skew: Duration) -> Self {
        Self {
            registry,
            clock_skew,
        }
    }

    /// Verify `raw` as a token of `declared` type.
    pub async fn verify(
        &self,
        raw: &str,
        token_use: TokenUse,
        declared: TokenType,
    ) -> Result<VerifiedClaims, TokenError> {
        self.verify_at(raw, token_use, declared, Utc::now()).await
    }

    /// [`verify`](Self::verify) evaluated at `now`.
    pub async fn verify_at(
        &self,
        raw: &str,
        token_use: TokenUse,
        declared: TokenType,
        now: DateTime<Utc>,
    ) -> Result<VerifiedClaims, TokenError> {
        // 1. Structure
        let segments: Vec<&str> = raw.trim().split('.').collect();
        let [header_b64, payload_b64, signature_b64] = segments.as_slice() else {
            return Err(TokenError::MalformedToken(format!(
                "expected 3 segments, got {}",
                segments.len()
            )));
        };
        let header: RawHeader = serde_json::from_slice(&decode_segment(header_b64, "header")?)
            .map_err(|e| TokenError::MalformedToken(format!("header: {e}")))?;
        let payload: Map<String, Value> =
            serde_json::from_slice(&decode_segment(payload_b64, "payload")?)
                .map_err(|e| TokenError::MalformedToken(format!("payload: {e}")))?;
        decode_segment(signature_b64, "signature")?;

        let issuer = string_claim(&payload, "iss")?;
        let subject = string_claim(&payload, "sub")?;
        let exp = payload
            .get("exp")
            .and_then(numeric_date)
            .ok_or_else(|| TokenError::MalformedToken("exp must be numeric".to_string()))?;
        let expires_at = timestamp(exp, "exp")?;
        let not_before = match payload.get("nbf") {
            None => None,
            Some(v) => Some(numeric_date(v).ok_or_else(|| {
                TokenError::MalformedToken("nbf must be numeric".to_string())
            })?),
        };
        let issued_at = payload
            .get("iat")
            .and_then(numeric_date)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        // 2. Issuer and key
        if !self.registry.trusts(&issuer) {
            return Err(TokenError::UntrustedIssuer(issuer));
        }
        let kid = header
            .kid
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| TokenError::UnknownKey("(no kid)".to_string()))?;
        let key = self.registry.resolve(&issuer, &kid).await?;

        // 3. Signature
        let alg = jsonwebtoken::Algorithm::from_str(&header.alg)
            .ok()
            .and_then(SigningAlgorithm::from_jwt_algorithm)
            .ok_or(TokenError::InvalidSignature)?;
        if alg != key.algorithm {
            debug!(header_alg = %alg, key_alg = %key.algorithm, "Algorithm does not match key");
            return Err(TokenError::InvalidSignature);
        }

        let mut validation = Validation::new(alg.jwt_algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<Value>(raw.trim(), &key.decoding, &validation).map_err(|e| {
            debug!(token_use = %token_use, error = %e, "Signature check failed");
            TokenError::InvalidSignature
        })?;

        // 4. Validity window
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        let now_secs = now.timestamp();
        if now_secs > exp.saturating_add(skew) {
            return Err(TokenError::TokenExpired);
        }
        if not_before.is_some_and(|nbf| now_secs.saturating_add(skew) < nbf) {
            return Err(TokenError::TokenNotYetValid);
        }

        // 5. Declared type
        if !declared.accepts_header_typ(header.typ.as_deref()) {
            return Err(TokenError::TokenTypeMismatch {
                declared: declared.urn().to_string(),
                actual: header.typ.unwrap_or_else(|| "none".to_string()),
            });
        }

        debug!(token_use = %token_use, iss = %issuer, sub = %subject, kid = %kid, "Token verified");
        Ok(VerifiedClaims {
            issuer,
            subject,
            audience: audience_set(&payload),
            scope: scope_set(&payload),
            expires_at,
            issued_at,
            token_type: declared,
            key_id: kid,
            raw: payload,
        })
    }
}
