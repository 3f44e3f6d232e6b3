//! Exchange policy: down-scoping, audience allow-list and delegation chains.
//!
//! # Rules
//!
//! Applied in order; the first failing rule decides the denial:
//!
//! | Rule | Denial |
//! |------|--------|
//! | requested scope ⊆ subject scope | `ScopeEscalation` |
//! | target audience allowed for (subject issuer, subject audience) | `AudienceNotPermitted` |
//! | delegation chain depth ≤ `max_delegation_depth` | `DelegationDepthExceeded` |
//!
//! ## Audience rules
//!
//! Each rule names the subject token's issuer, a pattern matched against the
//! subject token's audience, and the target audiences it permits. Patterns
//! accept a trailing `*` (`"https://api.example.com/*"`); a bare `"*"` also
//! matches tokens without an `aud` claim. When the request names no audience,
//! the first matching rule with a `default_audience` supplies it.
//!
//! ## Output claims
//!
//! The subject's claims minus those re-minted at issuance (`iss`, `iat`,
//! `exp`, `nbf`, `jti`), with `aud` set to the target and `scope` set to the
//! granted scope. With an actor, `act` becomes `{sub: <actor>}`, nesting any
//! `act` the subject token carried (RFC 8693 §4.1).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::error::DenialReason;
use super::verifier::VerifiedClaims;

/// Claims the minter sets itself.
const REMINTED_CLAIMS: [&str; 5] = ["iss", "iat", "exp", "nbf", "jti"];

/// Default maximum length of an `act` chain.
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 4;

fn wildcard() -> String {
    "*".to_string()
}

/// One entry of the audience allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceRule {
    /// Exact issuer of the subject token.
    pub issuer: String,
    /// Pattern for the subject token's audience (trailing `*` allowed).
    #[serde(default = "wildcard")]
    pub source_audience: String,
    /// Permitted target audiences (trailing `*` allowed).
    #[serde(default)]
    pub targets: Vec<String>,
    /// Target used when the request names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_audience: Option<String>,
}

impl AudienceRule {
    fn applies_to(&self, subject: &VerifiedClaims) -> bool {
        if self.issuer != subject.issuer {
            return false;
        }
        if self.source_audience == "*" {
            return true;
        }
        subject
            .audience
            .iter()
            .any(|aud| pattern_matches(&self.source_audience, aud))
    }

    fn permits(&self, target: &str) -> bool {
        self.targets.iter().any(|t| pattern_matches(t, target))
    }
}

/// Check if `pattern` (possibly with a trailing `*`) matches `value`.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        value.starts_with(prefix)
    } else {
        pattern == value
    }
}

/// Number of nested `act` entries.
fn chain_depth(act: Option<&Value>) -> usize {
    let mut depth = 0;
    let mut current = act;
    while let Some(Value::Object(entry)) = current {
        depth += 1;
        current = entry.get("act");
    }
    depth
}

/// Result of [`PolicyEngine::authorize`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDecision {
    /// Whether the exchange may proceed.
    pub permitted: bool,
    /// Claims for the output token. Empty on denial.
    pub output_claims: Map<String, Value>,
    /// Set iff `permitted` is false.
    pub denial_reason: Option<DenialReason>,
}

impl ExchangeDecision {
    fn permit(output_claims: Map<String, Value>) -> Self {
        Self {
            permitted: true,
            output_claims,
            denial_reason: None,
        }
    }

    fn deny(reason: DenialReason) -> Self {
        Self {
            permitted: false,
            output_claims: Map::new(),
            denial_reason: Some(reason),
        }
    }

    /// Output `aud`.
    #[must_use]
    pub fn audience(&self) -> Option<&str> {
        self.output_claims.get("aud").and_then(Value::as_str)
    }

    /// Output `scope` string.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.output_claims.get("scope").and_then(Value::as_str)
    }
}

/// The exchange policy engine. Pure: no I/O, no clock.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<AudienceRule>,
    max_delegation_depth: usize,
}

impl PolicyEngine {
    /// Build the engine from the ordered allow-list.
    #[must_use]
    pub fn new(rules: Vec<AudienceRule>, max_delegation_depth: usize) -> Self {
        Self {
            rules,
            max_delegation_depth,
        }
    }

    /// Decide whether `subject` (optionally acted on by `actor`) may obtain a
    /// token for `requested_audience` with `requested_scope`.
    ///
    /// An empty `requested_scope` keeps the subject's full scope.
    #[must_use]
    pub fn authorize(
        &self,
        subject: &VerifiedClaims,
        actor: Option<&VerifiedClaims>,
        requested_audience: Option<&str>,
        requested_scope: &[String],
    ) -> ExchangeDecision {
        // Scope may only narrow
        if let Some(extra) = requested_scope.iter().find(|s| !subject.scope.contains(*s)) {
            debug!(sub = %subject.subject, scope = %extra, "Requested scope not held by subject");
            return ExchangeDecision::deny(DenialReason::ScopeEscalation);
        }
        let granted: Vec<&str> = if requested_scope.is_empty() {
            subject.scope.iter().map(String::as_str).collect()
        } else {
            requested_scope.iter().map(String::as_str).collect()
        };

        // Audience allow-list
        let mut matching = self.rules.iter().filter(|r| r.applies_to(subject)).peekable();
        if matching.peek().is_none() {
            debug!(iss = %subject.issuer, "No audience rule for subject");
            return ExchangeDecision::deny(DenialReason::AudienceNotPermitted);
        }
        let target = match requested_audience {
            Some(aud) => {
                if !matching.any(|r| r.permits(aud)) {
                    debug!(aud = %aud, "Audience not in allow-list");
                    return ExchangeDecision::deny(DenialReason::AudienceNotPermitted);
                }
                aud.to_string()
            }
            None => match matching.find_map(|r| r.default_audience.clone()) {
                Some(aud) => aud,
                None => return ExchangeDecision::deny(DenialReason::AudienceNotPermitted),
            },
        };

        // Output claims
        let mut claims = subject.raw.clone();
        for claim in REMINTED_CLAIMS {
            claims.remove(claim);
        }
        claims.remove("scp");
        claims.insert("aud".to_string(), Value::String(target));
        if granted.is_empty() {
            claims.remove("scope");
        } else {
            claims.insert("scope".to_string(), Value::String(granted.join(" ")));
        }

        // Delegation chain
        if let Some(actor) = actor {
            let prior = subject.raw.get("act").cloned();
            let depth = 1 + chain_depth(prior.as_ref());
            if depth > self.max_delegation_depth {
                debug!(depth, max = self.max_delegation_depth, "Delegation chain too deep");
                return ExchangeDecision::deny(DenialReason::DelegationDepthExceeded);
            }
            let mut act = Map::new();
            act.insert("sub".to_string(), Value::String(actor.subject.clone()));
            if let Some(prior) = prior {
                act.insert("act".to_string(), prior);
            }
            claims.insert("act".to_string(), Value::Object(act));
        }

        ExchangeDecision::permit(claims)
    }
}
