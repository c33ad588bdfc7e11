//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// idgate - OIDC identity provider core
#[derive(Parser, Debug)]
#[command(name = "idgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "IDGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "IDGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "IDGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "IDGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "IDGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the identity provider (default)
    Serve,

    /// Load a key directory and print its JWKS
    Jwks {
        /// Directory of `private-<kid>.pem` / `public-<kid>.pem` pairs
        #[arg(long)]
        keys_path: PathBuf,

        /// Kid that must be present and would sign new tokens
        #[arg(long)]
        active_kid: String,
    },

    /// Hash a password (read from stdin) with Argon2id
    HashPassword,
}
