//! Token service server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit, http::StatusCode};
use jsonwebtoken::jwk::JwkSet;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, interval_at};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::{Config, KeysConfig, ServerConfig, TrustedIssuerConfig};
use crate::exchange::handler::{AppState, routes};
use crate::exchange::{
    ConfiguredIssuerRegistry, InMemoryKeyStore, JwksCache, KeyManager, PolicyEngine,
    TokenExchangeEngine, TokenMinter, TokenVerifier,
};
use crate::{Error, Result};

/// The running token service: key manager, exchange engine and HTTP state.
pub struct TokenService {
    config: Config,
    keys: Arc<KeyManager>,
    state: Arc<AppState>,
}

impl TokenService {
    /// Build the service and bootstrap its signing keys.
    pub async fn new(config: Config) -> Result<Self> {
        let keys = Arc::new(KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            config.key_manager_settings(),
        ));
        keys.initialize().await?;

        let engine = Arc::new(build_engine(&config, Arc::clone(&keys))?);
        let admin_token = config.admin.resolve_bearer_token();
        if admin_token.is_none() {
            warn!("No admin token configured - key administration endpoints disabled");
        }
        let state = Arc::new(AppState {
            engine,
            admin_token,
            invalid_token_status: config.invalid_token_status(),
        });

        Ok(Self {
            config,
            keys,
            state,
        })
    }

    /// The signing key manager.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Routes with the HTTP middleware stack applied.
    pub fn router(&self) -> Router {
        with_middleware(routes(Arc::clone(&self.state)), &self.config.server)
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = spawn_key_tasks(Arc::clone(&self.keys), &self.config.keys, &shutdown_tx);

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            host = %self.config.server.host,
            port = self.config.server.port,
            issuer = %self.config.issuer,
            algorithm = %self.config.keys.algorithm,
            "Security Token Service listening"
        );

        let mut server_rx = shutdown_tx.subscribe();
        let mut server = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_rx.recv().await;
                })
                .into_future(),
        );

        tokio::select! {
            result = &mut server => {
                let _ = shutdown_tx.send(());
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(Error::Io(e)),
                    Err(e) => Err(Error::Internal(e.to_string())),
                };
            }
            () = shutdown_signal() => {}
        }

        let _ = shutdown_tx.send(());
        match tokio::time::timeout(self.config.server.shutdown_timeout, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(Error::Io(e)),
            Ok(Err(e)) => return Err(Error::Internal(e.to_string())),
            Err(_) => warn!(
                timeout = ?self.config.server.shutdown_timeout,
                "Graceful shutdown timed out, dropping open connections"
            ),
        }
        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }
}

/// Body limit, request timeout (408), panic recovery and request tracing.
fn with_middleware(router: Router, server: &ServerConfig) -> Router {
    router
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            server.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Assemble verifier, policy and minter from `config` around `keys`.
pub fn build_engine(config: &Config, keys: Arc<KeyManager>) -> Result<TokenExchangeEngine> {
    let registry = build_registry(config, &keys)?;
    info!(issuers = registry.len(), "Trusted issuers configured");

    let verifier = TokenVerifier::new(Arc::new(registry), config.token.clock_skew);
    let policy = PolicyEngine::new(
        config.policy.audiences.clone(),
        config.token.max_delegation_depth,
    );
    let minter = TokenMinter::new(
        Arc::clone(&keys),
        config.issuer.clone(),
        config.token.lifetime,
    );
    Ok(TokenExchangeEngine::new(verifier, policy, minter, keys))
}

/// Build the issuer registry from `trust`, adding this service's own keys
/// when `trust_self` is set.
pub fn build_registry(config: &Config, keys: &Arc<KeyManager>) -> Result<ConfiguredIssuerRegistry> {
    let mut registry = ConfiguredIssuerRegistry::new(
        JwksCache::new(config.trust.jwks_cache_ttl)
            .map_err(|e| Error::Trust(format!("cannot build JWKS client: {e}")))?,
    );

    for issuer in &config.trust.issuers {
        registry = add_issuer(registry, issuer)?;
    }
    if config.trust.trust_self {
        registry = registry.with_local(config.issuer.clone(), Arc::clone(keys));
    }
    Ok(registry)
}

fn add_issuer(
    registry: ConfiguredIssuerRegistry,
    issuer: &TrustedIssuerConfig,
) -> Result<ConfiguredIssuerRegistry> {
    let name = issuer.issuer.clone();
    match (&issuer.jwks_uri, &issuer.jwks, &issuer.jwks_file) {
        (Some(uri), None, None) => Ok(registry.with_remote(name, uri.clone())),
        (None, Some(jwks), None) => Ok(registry.with_static(name, jwks.clone())),
        (None, None, Some(path)) => {
            let jwks = load_jwks_file(Path::new(path))?;
            debug!(issuer = %name, keys = jwks.keys.len(), path = %path, "Loaded JWKS file");
            Ok(registry.with_static(name, jwks))
        }
        _ => Err(Error::Trust(format!(
            "issuer {name} needs exactly one of jwks_uri, jwks, jwks_file"
        ))),
    }
}

fn load_jwks_file(path: &Path) -> Result<JwkSet> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Trust(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Trust(format!("invalid JWK Set in {}: {e}", path.display())))
}

/// Drive `tick()` and `rotate()` on their intervals until shutdown.
fn spawn_key_tasks(
    keys: Arc<KeyManager>,
    config: &KeysConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let tick_keys = Arc::clone(&keys);
    let tick_every = config.tick_interval;
    let mut tick_rx = shutdown_tx.subscribe();
    let ticker = tokio::spawn(async move {
        let mut ticks = interval(tick_every);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    match tick_keys.tick().await {
                        Ok(outcome) if !outcome.is_noop() => info!(
                            promoted = ?outcome.promoted,
                            retired = ?outcome.retired,
                            purged = outcome.purged.len(),
                            "Key tick applied"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Key tick failed"),
                    }
                }
                _ = tick_rx.recv() => break,
            }
        }
        debug!("Key tick task stopped");
    });

    let rotate_every = config.rotation_interval;
    let mut rotate_rx = shutdown_tx.subscribe();
    let rotator = tokio::spawn(async move {
        let mut rotations = interval_at(Instant::now() + rotate_every, rotate_every);
        loop {
            tokio::select! {
                _ = rotations.tick() => {
                    match keys.rotate().await {
                        Ok(kid) => info!(kid = %kid, "Scheduled rotation created pending key"),
                        Err(e) => error!(error = %e, "Scheduled rotation failed"),
                    }
                }
                _ = rotate_rx.recv() => break,
            }
        }
        debug!("Key rotation task stopped");
    });

    vec![ticker, rotator]
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
