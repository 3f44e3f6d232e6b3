//! Output token minting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::Header;
use serde_json::{Map, Value};
use tracing::debug;

use super::keys::{KeyError, KeyManager};
use super::request::TokenType;

/// Minting failures.
#[derive(Debug, thiserror::Error)]
pub enum MintError {
    /// The requested output type is not one this service produces.
    #[error("unsupported token type: {0}")]
    UnsupportedTokenType(String),

    /// No ACTIVE signing key.
    #[error("no signing key available")]
    SigningUnavailable,

    /// The key or claims could not be encoded.
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A signed output token. Returned to the caller, never stored.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// Compact JWS.
    pub serialized_token: String,
    /// Issued token type.
    pub token_type: TokenType,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// `jti`
    pub jti: String,
    /// `kid` of the signing key.
    pub key_id: String,
}

/// Signs output tokens with the Key Manager's ACTIVE key.
pub struct TokenMinter {
    keys: Arc<KeyManager>,
    issuer: String,
    lifetime: Duration,
}

impl TokenMinter {
    /// Create a minter issuing as `issuer` with tokens valid for `lifetime`.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            lifetime,
        }
    }

    /// Mint a token carrying `claims`.
    ///
    /// `requested_token_type` defaults to the JWT type; any other URN fails
    /// with [`MintError::UnsupportedTokenType`].
    pub fn mint(
        &self,
        claims: &Map<String, Value>,
        requested_token_type: Option<&str>,
    ) -> Result<MintedToken, MintError> {
        self.mint_at(claims, requested_token_type, Utc::now())
    }

    /// [`mint`](Self::mint) evaluated at `now`.
    pub fn mint_at(
        &self,
        claims: &Map<String, Value>,
        requested_token_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MintedToken, MintError> {
        let token_type = match requested_token_type {
            None => TokenType::Jwt,
            Some(urn) => match TokenType::from_urn(urn) {
                Some(TokenType::Jwt) => TokenType::Jwt,
                _ => return Err(MintError::UnsupportedTokenType(urn.to_string())),
            },
        };

        let key = self.keys.current_signing_key().map_err(|e| match e {
            KeyError::NoActiveKey => MintError::SigningUnavailable,
            other => MintError::Signing(other.to_string()),
        })?;
        let encoding_key = key
            .encoding_key()
            .map_err(|e| MintError::Signing(e.to_string()))?;

        let expires_in = self.lifetime.as_secs();
        let iat = now.timestamp();
        let exp = iat.saturating_add(i64::try_from(expires_in).unwrap_or(i64::MAX));
        let jti = uuid::Uuid::new_v4().to_string();

        let mut header = Header::new(key.algorithm.jwt_algorithm());
        header.kid = Some(key.key_id.clone());
        header.typ = Some("JWT".to_string());

        // Registered claims always come from the minter, never from input.
        let mut payload = claims.clone();
        payload.insert("iss".to_string(), Value::String(self.issuer.clone()));
        payload.insert("iat".to_string(), Value::from(iat));
        payload.insert("nbf".to_string(), Value::from(iat));
        payload.insert("exp".to_string(), Value::from(exp));
        payload.insert("jti".to_string(), Value::String(jti.clone()));
        let serialized_token = jsonwebtoken::encode(&header, &payload, &encoding_key)
            .map_err(|e| MintError::Signing(e.to_string()))?;

        debug!(kid = %key.key_id, jti = %jti, exp, "Minted token");
        Ok(MintedToken {
            serialized_token,
            token_type,
            expires_in,
            jti,
            key_id: key.key_id,
        })
    }
}
