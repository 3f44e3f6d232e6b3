//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::exchange::SigningAlgorithm;

/// Security Token Service - RFC 8693 token exchange with rotating signing keys
#[derive(Parser, Debug)]
#[command(name = "sts")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "STS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "STS_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "STS_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "STS_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "STS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the token service (default)
    Serve,

    /// Generate a signing key and print its public JWK
    Keygen {
        /// Algorithm (defaults to `keys.algorithm` from the config)
        #[arg(short, long, value_enum)]
        algorithm: Option<AlgorithmArg>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}

/// `--algorithm` values
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum AlgorithmArg {
    /// ECDSA P-256
    Es256,
    /// RSA-2048
    Rs256,
}

impl From<AlgorithmArg> for SigningAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Es256 => Self::ES256,
            AlgorithmArg::Rs256 => Self::RS256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["sts", "--port", "8080"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8080));
    }

    #[test]
    fn keygen_accepts_algorithm() {
        let cli = Cli::try_parse_from(["sts", "keygen", "--algorithm", "RS256"]).unwrap();
        match cli.command {
            Some(Command::Keygen { algorithm }) => {
                assert_eq!(algorithm.map(SigningAlgorithm::from), Some(SigningAlgorithm::RS256));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn check_config_takes_global_config_flag() {
        let cli = Cli::try_parse_from(["sts", "check-config", "--config", "sts.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("sts.yaml")));
    }
}
