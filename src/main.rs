use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use ringback::comms::local_api;
use ringback::config::Config;
use ringback::security::signature::compute_signature_hex;
use ringback::utils;

#[derive(Parser)]
#[command(name = "ringback", version, about = "Missed-call follow-up webhook and auth service")]
struct AppCli {
    /// Config file path (JSON). Environment variables override it.
    #[arg(short, long, global = true, env = "RINGBACK_CONFIG")]
    config: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
    },
    /// Print the webhook signature header value for a body file
    Sign {
        #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
        secret: String,
        /// Raw request body, exactly as it will be sent
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();

    match args.command {
        Some(Commands::Sign { secret, file }) => {
            let body = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            println!("{}", compute_signature_hex(&secret, &body));
        }
        Some(Commands::Serve { port }) => run_server(args.config.as_deref(), port).await?,
        None => run_server(args.config.as_deref(), 8080).await?,
    }

    Ok(())
}

async fn run_server(config_path: Option<&str>, port: u16) -> Result<()> {
    utils::logging::init();
    let config = Config::load(config_path)?;
    info!(
        version = ringback::VERSION,
        environment = ?config.environment,
        "starting ringback on port {port}"
    );
    local_api::serve(config, port).await
}
