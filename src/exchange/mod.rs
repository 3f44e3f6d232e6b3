//! RFC 8693 token exchange engine.
//!
//! # Flow
//!
//! ```text
//! POST /v1/token/exchange
//!   -> structural validation (grant type, token type URNs, actor pairing)
//!   -> verify subject token         (TokenVerifier + IssuerRegistry)
//!   -> verify actor token, if any
//!   -> authorize                    (PolicyEngine: scope, audience, act chain)
//!   -> mint                         (TokenMinter with the ACTIVE key)
//!   -> {access_token, issued_token_type, token_type, expires_in, scope}
//! ```
//!
//! Each request walks [`ExchangeState`] forward and stops at the first
//! failure, which is classified into one [`ExchangeError`] and audited.
//! Nothing is retried.
//!
//! The [`KeyManager`] is independent of requests: the server drives its
//! `tick()`/`rotate()` from timers and operators reach it through the admin
//! routes in [`handler`].

pub mod audit;
pub mod error;
pub mod handler;
pub mod jwk;
pub mod keys;
pub mod minter;
pub mod policy;
pub mod request;
pub mod store;
pub mod trust;
pub mod verifier;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use audit::AuditEvent;
pub use error::{DenialReason, ErrorClass, ExchangeError, TokenError, TokenUse};
pub use keys::{
    KeyError, KeyGenerator, KeyManager, KeyManagerSettings, KeyStatus, PublishedKey,
    RcgenKeyGenerator, SigningAlgorithm, SigningKey, TickOutcome,
};
pub use minter::{MintError, MintedToken, TokenMinter};
pub use policy::{AudienceRule, ExchangeDecision, PolicyEngine};
pub use request::{ExchangeRequest, GRANT_TYPE_TOKEN_EXCHANGE, TokenType};
pub use store::{InMemoryKeyStore, KeyStore, KeyStoreError};
pub use trust::{ConfiguredIssuerRegistry, IssuerRegistry, JwksCache};
pub use verifier::{TokenVerifier, VerifiedClaims};

/// Per-request progress. Linear; a failure at any step ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Request accepted for processing.
    Received,
    /// RFC 8693 structure checked.
    StructureValidated,
    /// Subject token verified.
    SubjectVerified,
    /// Actor token verified (delegation only).
    ActorVerified,
    /// Policy permitted the exchange.
    Authorized,
    /// Output token signed.
    Minted,
    /// Response produced.
    Responded,
    /// Stopped with an error of this class.
    Failed(ErrorClass),
}

/// Successful exchange response body (RFC 8693 §2.2.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// The issued token.
    pub access_token: String,
    /// Token type URN of `access_token`.
    pub issued_token_type: String,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Granted scope, space-delimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Drives verifier, policy and minter for each exchange request.
pub struct TokenExchangeEngine {
    verifier: TokenVerifier,
    policy: PolicyEngine,
    minter: TokenMinter,
    keys: Arc<KeyManager>,
}

impl TokenExchangeEngine {
    /// Assemble the engine. `minter` must sign with `keys`.
    #[must_use]
    pub fn new(
        verifier: TokenVerifier,
        policy: PolicyEngine,
        minter: TokenMinter,
        keys: Arc<KeyManager>,
    ) -> Self {
        Self {
            verifier,
            policy,
            minter,
            keys,
        }
    }

    /// The signing key manager.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Perform one exchange.
    pub async fn exchange(
        &self,
        request: &ExchangeRequest,
    ) -> Result<ExchangeResponse, ExchangeError> {
        self.exchange_at(request, Utc::now()).await
    }

    /// [`exchange`](Self::exchange) evaluated at `now`.
    pub async fn exchange_at(
        &self,
        request: &ExchangeRequest,
        now: DateTime<Utc>,
    ) -> Result<ExchangeResponse, ExchangeError> {
        let mut state = ExchangeState::Received;
        let result = self.run(request, now, &mut state).await;
        if let Err(ref e) = result {
            let failed_at = state;
            state = ExchangeState::Failed(e.class());
            debug!(failed_at = ?failed_at, state = ?state, error = %e, "Token exchange failed");
        }
        result
    }

    async fn run(
        &self,
        request: &ExchangeRequest,
        now: DateTime<Utc>,
        state: &mut ExchangeState,
    ) -> Result<ExchangeResponse, ExchangeError> {
        let validated = request.validate().map_err(|e| record(e, None))?;
        *state = ExchangeState::StructureValidated;

        let subject = self
            .verifier
            .verify_at(
                validated.subject_token,
                TokenUse::Subject,
                validated.subject_token_type,
                now,
            )
            .await
            .map_err(|e| record(ExchangeError::from_verification(TokenUse::Subject, e), None))?;
        *state = ExchangeState::SubjectVerified;

        let actor = match validated.actor {
            Some((token, token_type)) => {
                let claims = self
                    .verifier
                    .verify_at(token, TokenUse::Actor, token_type, now)
                    .await
                    .map_err(|e| {
                        record(
                            ExchangeError::from_verification(TokenUse::Actor, e),
                            Some(&subject),
                        )
                    })?;
                *state = ExchangeState::ActorVerified;
                Some(claims)
            }
            None => None,
        };

        let decision = self.policy.authorize(
            &subject,
            actor.as_ref(),
            validated.audience,
            validated.scope,
        );
        if let Some(reason) = decision.denial_reason {
            return Err(record(ExchangeError::PolicyDenied(reason), Some(&subject)));
        }
        *state = ExchangeState::Authorized;

        let minted = self
            .minter
            .mint_at(&decision.output_claims, validated.requested_token_type, now)
            .map_err(|e| record(e.into(), Some(&subject)))?;
        *state = ExchangeState::Minted;

        let scope = decision.scope().map(str::to_string);
        audit::emit(&AuditEvent::issued(
            &subject.subject,
            &subject.issuer,
            actor.as_ref().map(|a| a.subject.as_str()),
            decision.audience().unwrap_or_default(),
            scope.as_deref().unwrap_or_default(),
            &minted.jti,
            &minted.key_id,
        ));

        let response = ExchangeResponse {
            access_token: minted.serialized_token,
            issued_token_type: minted.token_type.urn().to_string(),
            token_type: "Bearer".to_string(),
            expires_in: minted.expires_in,
            scope,
        };
        *state = ExchangeState::Responded;
        Ok(response)
    }
}

/// Audit a failure under its class and hand it back.
fn record(err: ExchangeError, subject: Option<&VerifiedClaims>) -> ExchangeError {
    let event = match (&err, subject) {
        (ExchangeError::RequestMalformed(_), _) => AuditEvent::malformed(err.to_string()),
        (ExchangeError::TokenInvalid { source, .. }, _) => {
            AuditEvent::invalid(source.kind(), err.to_string())
        }
        (ExchangeError::PolicyDenied(reason), s) => AuditEvent::denied(
            s.map_or("", |s| s.subject.as_str()),
            s.map_or("", |s| s.issuer.as_str()),
            reason.to_string(),
        ),
        (ExchangeError::ServiceUnavailable(_), _) => {
            warn!(error = %err, "Token exchange unavailable");
            AuditEvent::unavailable(err.to_string())
        }
    };
    audit::emit(&event);
    err
}
