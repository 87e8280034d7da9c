//! Parcel CLI - operator tooling for signed links and the relay session

mod api_client;
mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::auth_cmd::run_auth;
use crate::commands::link::{run_sign, run_verify};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "parcel_cli=warn".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sign {
            subject,
            ttl_secs,
            client_ip,
            base_url,
            json,
        } => run_sign(&subject, ttl_secs, client_ip, base_url, json),
        Commands::Verify {
            target,
            expires,
            signature,
            client_ip,
        } => run_verify(&target, expires, signature, client_ip),
        Commands::Auth { command } => {
            tracing::debug!("Running auth command against parcel-api");
            run_auth(command, cli.api_url).await
        }
    }
}
