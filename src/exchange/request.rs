//! RFC 8693 request model and structural validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ExchangeError;

/// The token exchange grant type URN.
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Token type identifiers this service understands (RFC 8693 §3).
///
/// SAML assertions and refresh tokens are valid RFC 8693 identifiers but are
/// not JWS tokens, so they are not accepted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    /// `urn:ietf:params:oauth:token-type:jwt`
    Jwt,
    /// `urn:ietf:params:oauth:token-type:access_token`
    AccessToken,
    /// `urn:ietf:params:oauth:token-type:id_token`
    IdToken,
}

impl TokenType {
    /// Parse a token type URN.
    #[must_use]
    pub fn from_urn(urn: &str) -> Option<Self> {
        match urn {
            "urn:ietf:params:oauth:token-type:jwt" => Some(Self::Jwt),
            "urn:ietf:params:oauth:token-type:access_token" => Some(Self::AccessToken),
            "urn:ietf:params:oauth:token-type:id_token" => Some(Self::IdToken),
            _ => None,
        }
    }

    /// The URN for this token type.
    #[must_use]
    pub fn urn(self) -> &'static str {
        match self {
            Self::Jwt => "urn:ietf:params:oauth:token-type:jwt",
            Self::AccessToken => "urn:ietf:params:oauth:token-type:access_token",
            Self::IdToken => "urn:ietf:params:oauth:token-type:id_token",
        }
    }

    /// Whether a JWS header `typ` fits this declared type.
    ///
    /// - `jwt`: any JWS.
    /// - `access_token`: `at+jwt` (RFC 9068), with or without `application/`.
    /// - `id_token`: `typ` absent or `JWT`.
    #[must_use]
    pub fn accepts_header_typ(self, typ: Option<&str>) -> bool {
        let typ = typ.map(|t| {
            let t = t.trim();
            t.strip_prefix("application/").unwrap_or(t).to_ascii_lowercase()
        });
        match self {
            Self::Jwt => true,
            Self::AccessToken => typ.as_deref() == Some("at+jwt"),
            Self::IdToken => matches!(typ.as_deref(), None | Some("jwt")),
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.urn())
    }
}

/// A token exchange request as delivered by the routing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeRequest {
    /// Must equal [`GRANT_TYPE_TOKEN_EXCHANGE`].
    pub grant_type: String,
    /// Token representing the identity on whose behalf exchange is requested.
    pub subject_token: String,
    /// Token type URN of `subject_token`.
    pub subject_token_type: String,
    /// Token representing the acting party.
    pub actor_token: Option<String>,
    /// Token type URN of `actor_token`; required iff `actor_token` is present.
    pub actor_token_type: Option<String>,
    /// Desired output token type URN.
    pub requested_token_type: Option<String>,
    /// Logical name of the target service.
    pub audience: Option<String>,
    /// Requested scope, in request order, without duplicates.
    pub scope: Vec<String>,
    /// Target resource URI.
    pub resource: Option<String>,
}

/// Form or JSON body of `POST /v1/token/exchange`.
///
/// `scope` is the space-delimited OAuth string. Empty values are treated as
/// omitted (RFC 6749 §3.1).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenExchangeForm {
    /// `grant_type`
    #[serde(default)]
    pub grant_type: String,
    /// `resource`
    #[serde(default)]
    pub resource: Option<String>,
    /// `audience`
    #[serde(default)]
    pub audience: Option<String>,
    /// `scope`
    #[serde(default)]
    pub scope: Option<String>,
    /// `requested_token_type`
    #[serde(default)]
    pub requested_token_type: Option<String>,
    /// `subject_token`
    #[serde(default)]
    pub subject_token: String,
    /// `subject_token_type`
    #[serde(default)]
    pub subject_token_type: String,
    /// `actor_token`
    #[serde(default)]
    pub actor_token: Option<String>,
    /// `actor_token_type`
    #[serde(default)]
    pub actor_token_type: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl From<TokenExchangeForm> for ExchangeRequest {
    fn from(form: TokenExchangeForm) -> Self {
        Self {
            grant_type: form.grant_type,
            subject_token: form.subject_token,
            subject_token_type: form.subject_token_type,
            actor_token: non_empty(form.actor_token),
            actor_token_type: non_empty(form.actor_token_type),
            requested_token_type: non_empty(form.requested_token_type),
            audience: non_empty(form.audience),
            scope: parse_scope(form.scope.as_deref().unwrap_or("")),
            resource: non_empty(form.resource),
        }
    }
}

/// Split a space-delimited scope string, dropping duplicates but keeping order.
#[must_use]
pub fn parse_scope(scope: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in scope.split_whitespace() {
        if !out.iter().any(|s| s == item) {
            out.push(item.to_string());
        }
    }
    out
}

/// A request that passed structural validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest<'a> {
    /// Subject token.
    pub subject_token: &'a str,
    /// Declared subject token type.
    pub subject_token_type: TokenType,
    /// Actor token and its declared type.
    pub actor: Option<(&'a str, TokenType)>,
    /// Raw requested output type; the minter decides whether it can produce it.
    pub requested_token_type: Option<&'a str>,
    /// Requested audience, falling back to `resource`.
    pub audience: Option<&'a str>,
    /// Requested scope.
    pub scope: &'a [String],
}

fn token_type(field: &str, urn: &str) -> Result<TokenType, ExchangeError> {
    TokenType::from_urn(urn)
        .ok_or_else(|| ExchangeError::RequestMalformed(format!("unsupported {field}: {urn}")))
}

impl ExchangeRequest {
    /// Enforce RFC 8693 structure before any cryptographic work.
    pub fn validate(&self) -> Result<ValidatedRequest<'_>, ExchangeError> {
        if self.grant_type != GRANT_TYPE_TOKEN_EXCHANGE {
            return Err(ExchangeError::RequestMalformed(format!(
                "grant_type must be '{GRANT_TYPE_TOKEN_EXCHANGE}'"
            )));
        }
        if self.subject_token.trim().is_empty() {
            return Err(ExchangeError::RequestMalformed(
                "subject_token is required".to_string(),
            ));
        }
        if self.subject_token_type.trim().is_empty() {
            return Err(ExchangeError::RequestMalformed(
                "subject_token_type is required".to_string(),
            ));
        }
        let subject_token_type = token_type("subject_token_type", &self.subject_token_type)?;

        let actor = match (&self.actor_token, &self.actor_token_type) {
            (Some(token), Some(urn)) => Some((token.as_str(), token_type("actor_token_type", urn)?)),
            (Some(_), None) => {
                return Err(ExchangeError::RequestMalformed(
                    "actor_token_type is required when actor_token is present".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(ExchangeError::RequestMalformed(
                    "actor_token_type must not be sent without actor_token".to_string(),
                ));
            }
            (None, None) => None,
        };

        Ok(ValidatedRequest {
            subject_token: &self.subject_token,
            subject_token_type,
            actor,
            requested_token_type: self.requested_token_type.as_deref(),
            audience: self.audience.as_deref().or(self.resource.as_deref()),
            scope: &self.scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ExchangeRequest {
        ExchangeRequest {
            grant_type: GRANT_TYPE_TOKEN_EXCHANGE.to_string(),
            subject_token: "a.b.c".to_string(),
            subject_token_type: TokenType::Jwt.urn().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_request_validates() {
        let req = valid();
        let validated = req.validate().unwrap();
        assert_eq!(validated.subject_token_type, TokenType::Jwt);
        assert!(validated.actor.is_none());
    }

    #[test]
    fn wrong_grant_type_is_rejected() {
        let req = ExchangeRequest {
            grant_type: "client_credentials".to_string(),
            ..valid()
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
    }

    #[test]
    fn empty_subject_token_is_rejected() {
        let req = ExchangeRequest {
            subject_token: "  ".to_string(),
            ..valid()
        };
        assert!(matches!(req.validate(), Err(ExchangeError::RequestMalformed(_))));
    }

    #[test]
    fn actor_token_without_type_is_rejected() {
        let req = ExchangeRequest {
            actor_token: Some("x.y.z".to_string()),
            ..valid()
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("actor_token_type"));
    }

    #[test]
    fn actor_type_without_token_is_rejected() {
        let req = ExchangeRequest {
            actor_token_type: Some(TokenType::Jwt.urn().to_string()),
            ..valid()
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn unknown_subject_token_type_is_rejected() {
        let req = ExchangeRequest {
            subject_token_type: "urn:ietf:params:oauth:token-type:saml2".to_string(),
            ..valid()
        };
        let err = req.validate().unwrap_err();
        assert!(err.public_description().contains("subject_token_type"));
    }

    #[test]
    fn resource_is_used_when_audience_missing() {
        let req = ExchangeRequest {
            resource: Some("https://orders.internal".to_string()),
            ..valid()
        };
        assert_eq!(
            req.validate().unwrap().audience,
            Some("https://orders.internal")
        );

        let req = ExchangeRequest {
            audience: Some("orders-api".to_string()),
            resource: Some("https://orders.internal".to_string()),
            ..valid()
        };
        assert_eq!(req.validate().unwrap().audience, Some("orders-api"));
    }

    #[test]
    fn parse_scope_keeps_order_and_drops_duplicates() {
        assert_eq!(
            parse_scope(" orders:read  orders:write orders:read "),
            vec!["orders:read", "orders:write"]
        );
        assert!(parse_scope("").is_empty());
    }

    #[test]
    fn form_treats_empty_values_as_omitted() {
        let form: TokenExchangeForm = serde_urlencoded::from_str(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange\
             &subject_token=a.b.c\
             &subject_token_type=urn%3Aietf%3Aparams%3Aoauth%3Atoken-type%3Ajwt\
             &actor_token=&actor_token_type=&scope=a+b",
        )
        .unwrap();
        let req = ExchangeRequest::from(form);
        assert!(req.actor_token.is_none());
        assert!(req.actor_token_type.is_none());
        assert_eq!(req.scope, vec!["a", "b"]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn header_typ_rules_per_token_type() {
        assert!(TokenType::Jwt.accepts_header_typ(Some("anything")));
        assert!(TokenType::Jwt.accepts_header_typ(None));
        assert!(TokenType::AccessToken.accepts_header_typ(Some("at+jwt")));
        assert!(TokenType::AccessToken.accepts_header_typ(Some("application/at+jwt")));
        assert!(!TokenType::AccessToken.accepts_header_typ(Some("JWT")));
        assert!(!TokenType::AccessToken.accepts_header_typ(None));
        assert!(TokenType::IdToken.accepts_header_typ(None));
        assert!(TokenType::IdToken.accepts_header_typ(Some("JWT")));
        assert!(!TokenType::IdToken.accepts_header_typ(Some("at+jwt")));
    }
}
