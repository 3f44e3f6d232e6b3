//! Exchange failure taxonomy.
//!
//! Internal failures from every stage are folded into exactly one
//! [`ExchangeError`] class before they leave the engine. Each class maps to an
//! OAuth error code; only [`ExchangeError::public_description`] text is meant
//! for the caller. `Display` output carries internal detail and is for logs.

use std::fmt;

use serde::Serialize;

use super::keys::KeyError;
use super::minter::MintError;

/// Which token of the request a verification failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    /// `subject_token`
    Subject,
    /// `actor_token`
    Actor,
}

impl fmt::Display for TokenUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject => f.write_str("subject"),
            Self::Actor => f.write_str("actor"),
        }
    }
}

/// Token verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The token is not a well-formed JWS with the required claims.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The `iss` claim names no trusted issuer.
    #[error("untrusted issuer: {0}")]
    UntrustedIssuer(String),

    /// The header `kid` is missing or unknown to the issuer.
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature mismatch, or `alg` disagreeing with the trusted key.
    #[error("invalid signature")]
    InvalidSignature,

    /// `exp` is in the past beyond the clock-skew allowance.
    #[error("token expired")]
    TokenExpired,

    /// `nbf` is in the future beyond the clock-skew allowance.
    #[error("token not yet valid")]
    TokenNotYetValid,

    /// The token's `typ` does not fit the declared token type.
    #[error("token type mismatch: declared {declared}, header typ {actual}")]
    TokenTypeMismatch {
        /// Declared token type URN.
        declared: String,
        /// Header `typ` (or `none`).
        actual: String,
    },

    /// The issuer's key source could not be reached. Not a token defect.
    #[error("issuer keys unavailable: {0}")]
    IssuerUnavailable(String),
}

impl TokenError {
    /// Stable kind name for the audit trail.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedToken(_) => "MalformedToken",
            Self::UntrustedIssuer(_) => "UntrustedIssuer",
            Self::UnknownKey(_) => "UnknownKey",
            Self::InvalidSignature => "InvalidSignature",
            Self::TokenExpired => "TokenExpired",
            Self::TokenNotYetValid => "TokenNotYetValid",
            Self::TokenTypeMismatch { .. } => "TokenTypeMismatch",
            Self::IssuerUnavailable(_) => "IssuerUnavailable",
        }
    }

    fn public_text(&self) -> &'static str {
        match self {
            Self::MalformedToken(_) => "token is malformed",
            Self::UntrustedIssuer(_) => "token issuer is not trusted",
            Self::UnknownKey(_) => "token signing key is unknown",
            Self::InvalidSignature => "token signature is invalid",
            Self::TokenExpired => "token is expired",
            Self::TokenNotYetValid => "token is not yet valid",
            Self::TokenTypeMismatch { .. } => "token does not match the declared token type",
            Self::IssuerUnavailable(_) => "token issuer keys are unavailable",
        }
    }
}

/// Why policy refused an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DenialReason {
    /// Requested scope is not a subset of the subject token's scope.
    ScopeEscalation,
    /// Requested audience is not in the allow-list.
    AudienceNotPermitted,
    /// The delegation chain would exceed the configured depth.
    DelegationDepthExceeded,
}

impl DenialReason {
    fn public_text(self) -> &'static str {
        match self {
            Self::ScopeEscalation => "requested scope exceeds the subject token scope",
            Self::AudienceNotPermitted => "requested audience is not permitted",
            Self::DelegationDepthExceeded => "delegation chain is too deep",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeEscalation => f.write_str("ScopeEscalation"),
            Self::AudienceNotPermitted => f.write_str("AudienceNotPermitted"),
            Self::DelegationDepthExceeded => f.write_str("DelegationDepthExceeded"),
        }
    }
}

/// External error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Missing or invalid RFC 8693 fields → 400.
    RequestMalformed,
    /// Subject or actor token rejected → 400/401.
    TokenInvalid,
    /// Policy refusal → 403.
    PolicyDenied,
    /// Signing or backend unavailable → 503.
    ServiceUnavailable,
}

/// A classified exchange failure.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The request does not satisfy RFC 8693 structure rules.
    #[error("malformed request: {0}")]
    RequestMalformed(String),

    /// A presented token failed verification.
    #[error("{token_use} token invalid: {source}")]
    TokenInvalid {
        /// Which token failed.
        token_use: TokenUse,
        /// Verification failure.
        #[source]
        source: TokenError,
    },

    /// Policy refused the exchange.
    #[error("exchange denied: {0}")]
    PolicyDenied(DenialReason),

    /// The service cannot issue tokens right now. The payload is internal.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ExchangeError {
    /// Classify a verifier failure.
    #[must_use]
    pub fn from_verification(token_use: TokenUse, err: TokenError) -> Self {
        match err {
            TokenError::IssuerUnavailable(detail) => {
                Self::ServiceUnavailable(format!("{token_use} issuer keys: {detail}"))
            }
            source => Self::TokenInvalid { token_use, source },
        }
    }

    /// External error class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RequestMalformed(_) => ErrorClass::RequestMalformed,
            Self::TokenInvalid { .. } => ErrorClass::TokenInvalid,
            Self::PolicyDenied(_) => ErrorClass::PolicyDenied,
            Self::ServiceUnavailable(_) => ErrorClass::ServiceUnavailable,
        }
    }

    /// OAuth `error` code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self.class() {
            ErrorClass::RequestMalformed => "invalid_request",
            ErrorClass::TokenInvalid => "invalid_grant",
            ErrorClass::PolicyDenied => "access_denied",
            ErrorClass::ServiceUnavailable => "temporarily_unavailable",
        }
    }

    /// Caller-safe `error_description`.
    #[must_use]
    pub fn public_description(&self) -> String {
        match self {
            Self::RequestMalformed(msg) => msg.clone(),
            Self::TokenInvalid { token_use, source } => {
                format!("{token_use}_token rejected: {}", source.public_text())
            }
            Self::PolicyDenied(reason) => reason.public_text().to_string(),
            Self::ServiceUnavailable(_) => {
                "the service is temporarily unable to issue tokens".to_string()
            }
        }
    }
}

impl From<MintError> for ExchangeError {
    fn from(err: MintError) -> Self {
        match err {
            MintError::UnsupportedTokenType(urn) => {
                Self::RequestMalformed(format!("unsupported requested_token_type: {urn}"))
            }
            other => Self::ServiceUnavailable(other.to_string()),
        }
    }
}

impl From<KeyError> for ExchangeError {
    fn from(err: KeyError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_classify_as_invalid_grant() {
        let err = ExchangeError::from_verification(TokenUse::Subject, TokenError::TokenExpired);
        assert_eq!(err.class(), ErrorClass::TokenInvalid);
        assert_eq!(err.error_code(), "invalid_grant");
        assert_eq!(
            err.public_description(),
            "subject_token rejected: token is expired"
        );
    }

    #[test]
    fn issuer_outage_is_service_unavailable() {
        let err = ExchangeError::from_verification(
            TokenUse::Actor,
            TokenError::IssuerUnavailable("connect timeout to 10.0.0.7".to_string()),
        );
        assert_eq!(err.class(), ErrorClass::ServiceUnavailable);
        // Internal detail never reaches the caller
        assert!(!err.public_description().contains("10.0.0.7"));
    }

    #[test]
    fn policy_denial_maps_to_access_denied() {
        let err = ExchangeError::PolicyDenied(DenialReason::ScopeEscalation);
        assert_eq!(err.error_code(), "access_denied");
        assert_eq!(err.class(), ErrorClass::PolicyDenied);
    }

    #[test]
    fn unsupported_token_type_is_malformed_request() {
        let err: ExchangeError =
            MintError::UnsupportedTokenType("urn:x:custom".to_string()).into();
        assert_eq!(err.error_code(), "invalid_request");
    }

    #[test]
    fn signing_unavailable_hides_cause() {
        let err: ExchangeError = MintError::SigningUnavailable.into();
        assert_eq!(err.error_code(), "temporarily_unavailable");
        assert_eq!(
            err.public_description(),
            "the service is temporarily unable to issue tokens"
        );
    }

    #[test]
    fn token_error_kind_is_stable() {
        assert_eq!(TokenError::UnknownKey("k".to_string()).kind(), "UnknownKey");
        assert_eq!(
            TokenError::UntrustedIssuer("https://evil.example".to_string()).kind(),
            "UntrustedIssuer"
        );
    }

    #[test]
    fn untrusted_issuer_description_does_not_echo_issuer() {
        let err = ExchangeError::from_verification(
            TokenUse::Subject,
            TokenError::UntrustedIssuer("https://evil.example".to_string()),
        );
        assert!(!err.public_description().contains("evil"));
    }
}
