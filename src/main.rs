//! idgate - OIDC identity provider core

use std::io::{self, BufRead};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use idgate::{
    auth::hash_password,
    cli::{Cli, Command},
    config::Config,
    keys::KeyStore,
    server::{AppContext, Server},
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
        Some(Command::Jwks {
            ref keys_path,
            ref active_kid,
        }) => run_jwks(keys_path, active_kid),
        Some(Command::HashPassword) => run_hash_password(),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print the JWKS of a key directory
fn run_jwks(keys_path: &Path, active_kid: &str) -> ExitCode {
    let store = match KeyStore::load(keys_path, active_kid) {
        Ok(s) => s,
        Err(e) => {
            let e = idgate::Error::from(e);
            error!("Failed to load keys: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    match serde_json::to_string_pretty(&store.jwks()) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize JWKS: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Hash the first line of stdin
fn run_hash_password() -> ExitCode {
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        error!("Failed to read password: {e}");
        return ExitCode::FAILURE;
    }
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        error!("Empty password");
        return ExitCode::FAILURE;
    }

    match hash_password(password) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to hash password: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the identity provider
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        issuer = %config.auth.issuer,
        clients = config.oidc.clients.len(),
        "Starting idgate"
    );

    let ctx = match AppContext::from_config(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to initialize: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = Server::new(ctx).run().await {
        error!("Server error: {e}");
        return ExitCode::from(e.exit_code());
    }

    info!("idgate shutdown complete");
    ExitCode::SUCCESS
}
