//! Configuration management

use std::{env, path::Path, time::Duration};

use axum::http::StatusCode;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::jwk::JwkSet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::exchange::policy::{AudienceRule, DEFAULT_MAX_DELEGATION_DEPTH};
use crate::exchange::{KeyManagerSettings, SigningAlgorithm};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// `iss` of every token this service mints.
    pub issuer: String,
    /// Output token settings
    pub token: TokenConfig,
    /// Signing key lifecycle
    pub keys: KeysConfig,
    /// Trusted subject/actor token issuers
    pub trust: TrustConfig,
    /// Exchange policy
    pub policy: PolicyConfig,
    /// Key administration endpoints
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            issuer: "http://localhost:3000".to_string(),
            token: TokenConfig::default(),
            keys: KeysConfig::default(),
            trust: TrustConfig::default(),
            policy: PolicyConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024, // tokens, not uploads
        }
    }
}

/// Output token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime of minted tokens (`expires_in`)
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
    /// Allowance for `exp`/`nbf` checks on presented tokens
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Maximum nesting of `act` claims
    pub max_delegation_depth: usize,
    /// HTTP status for `invalid_grant` (400 or 401)
    pub invalid_token_status: u16,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(3600),
            clock_skew: Duration::from_secs(30),
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            invalid_token_status: 400,
        }
    }
}

/// Signing key lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Algorithm for newly generated keys
    pub algorithm: SigningAlgorithm,
    /// Time a new key is published before it signs
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Time a retired key stays published
    #[serde(with = "humantime_serde")]
    pub retired_retention: Duration,
    /// Automatic rotation interval
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    /// Interval of the promotion/purge tick
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            algorithm: SigningAlgorithm::ES256,
            grace_period: Duration::from_secs(5 * 60),
            retired_retention: Duration::from_secs(2 * 3600),
            rotation_interval: Duration::from_secs(24 * 3600),
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Trusted issuers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// External issuers whose tokens may be exchanged
    pub issuers: Vec<TrustedIssuerConfig>,
    /// Accept this service's own tokens as subject/actor tokens
    pub trust_self: bool,
    /// How long a fetched remote JWKS is cached
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            issuers: Vec::new(),
            trust_self: true,
            jwks_cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// One trusted issuer. Exactly one key source must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedIssuerConfig {
    /// Exact `iss` value
    pub issuer: String,
    /// Remote JWK Set URL (HTTPS)
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Inline JWK Set
    #[serde(default)]
    pub jwks: Option<JwkSet>,
    /// Path to a JWK Set JSON file
    #[serde(default)]
    pub jwks_file: Option<String>,
}

/// Exchange policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Audience allow-list, evaluated in order
    pub audiences: Vec<AudienceRule>,
}

/// Key administration endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for `/admin/*` (supports `env:VAR_NAME`). Unset disables admin.
    pub bearer_token: Option<String>,
}

impl AdminConfig {
    /// Resolve the bearer token (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        self.bearer_token
            .as_ref()
            .map(|token| {
                if let Some(var_name) = token.strip_prefix("env:") {
                    env::var(var_name).unwrap_or_default()
                } else {
                    token.clone()
                }
            })
            .filter(|token| !token.is_empty())
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (STS_ prefix, __ for nesting)
        figment = figment.merge(Env::prefixed("STS_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        self.issuer = expand_string(&re, &self.issuer);
        for issuer in &mut self.trust.issuers {
            issuer.issuer = expand_string(&re, &issuer.issuer);
            if let Some(uri) = issuer.jwks_uri.as_mut() {
                *uri = expand_string(&re, uri);
            }
            if let Some(file) = issuer.jwks_file.as_mut() {
                *file = expand_home(&expand_string(&re, file));
            }
        }
    }

    /// Reject settings that would break token verification or rotation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.issuer.trim().is_empty() {
            return fail("issuer must not be empty".to_string());
        }
        if self.token.lifetime.is_zero() {
            return fail("token.lifetime must be positive".to_string());
        }
        if !matches!(self.token.invalid_token_status, 400 | 401) {
            return fail(format!(
                "token.invalid_token_status must be 400 or 401, got {}",
                self.token.invalid_token_status
            ));
        }
        if self.token.max_delegation_depth == 0 {
            return fail("token.max_delegation_depth must be at least 1".to_string());
        }
        // A retired key must outlive every token it signed.
        if self.keys.retired_retention < self.token.lifetime + self.token.clock_skew {
            return fail(
                "keys.retired_retention must be at least token.lifetime + token.clock_skew"
                    .to_string(),
            );
        }
        if self.keys.tick_interval.is_zero() {
            return fail("keys.tick_interval must be positive".to_string());
        }
        if self.keys.rotation_interval <= self.keys.grace_period {
            return fail("keys.rotation_interval must exceed keys.grace_period".to_string());
        }
        for issuer in &self.trust.issuers {
            let sources = usize::from(issuer.jwks_uri.is_some())
                + usize::from(issuer.jwks.is_some())
                + usize::from(issuer.jwks_file.is_some());
            if sources != 1 {
                return fail(format!(
                    "trust issuer {} needs exactly one of jwks_uri, jwks, jwks_file",
                    issuer.issuer
                ));
            }
        }
        Ok(())
    }

    /// Key manager settings derived from `keys`.
    #[must_use]
    pub fn key_manager_settings(&self) -> KeyManagerSettings {
        KeyManagerSettings {
            algorithm: self.keys.algorithm,
            grace_period: self.keys.grace_period,
            retired_retention: self.keys.retired_retention,
        }
    }

    /// Status used for `invalid_grant` responses.
    #[must_use]
    pub fn invalid_token_status(&self) -> StatusCode {
        StatusCode::from_u16(self.token.invalid_token_status).unwrap_or(StatusCode::BAD_REQUEST)
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    /// Parse "100ms", "30s", "5m", "2h", "1d", or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a supported duration.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
            return ms
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3600)
        } else if let Some(v) = s.strip_suffix('d') {
            (v, 86_400)
        } else {
            (s, 1)
        };

        digits
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
            .and_then(|n| {
                n.checked_mul(unit_secs)
                    .map(Duration::from_secs)
                    .ok_or_else(|| format!("duration '{s}' overflows"))
            })
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }
}
