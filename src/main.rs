//! Security Token Service - RFC 8693 token exchange with rotating JWKS keys.

use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use sts::{
    cli::{Cli, Command},
    config::Config,
    exchange::{KeyStatus, SigningAlgorithm, SigningKey},
    server::TokenService,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keygen { algorithm }) => run_keygen(&cli, algorithm.map(Into::into)),
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Generate one key pair and print its public JWK
fn run_keygen(cli: &Cli, algorithm: Option<SigningAlgorithm>) -> ExitCode {
    let algorithm = match algorithm {
        Some(a) => a,
        None => match load_config(cli) {
            Some(config) => config.keys.algorithm,
            None => return ExitCode::FAILURE,
        },
    };

    let now = Utc::now();
    let jwk = SigningKey::generate(algorithm, KeyStatus::Pending, now, now)
        .and_then(|key| key.public_jwk());
    match jwk.map(|jwk| serde_json::to_string_pretty(&jwk)) {
        Ok(Ok(json)) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            eprintln!("Failed to serialize JWK: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Key generation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Validate configuration and summarize it
fn run_check_config(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    println!("Configuration OK");
    println!("  issuer:          {}", config.issuer);
    println!("  listen:          {}:{}", config.server.host, config.server.port);
    println!("  algorithm:       {}", config.keys.algorithm);
    println!("  token lifetime:  {}s", config.token.lifetime.as_secs());
    println!(
        "  trusted issuers: {}{}",
        config.trust.issuers.len(),
        if config.trust.trust_self { " (+ self)" } else { "" }
    );
    println!("  audience rules:  {}", config.policy.audiences.len());
    println!(
        "  admin API:       {}",
        if config.admin.resolve_bearer_token().is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    ExitCode::SUCCESS
}

/// Run the token service
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        issuer = %config.issuer,
        "Starting Security Token Service"
    );

    let service = match TokenService::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start token service: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = service.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
