//! scripthost - run user scripts in per-user workspaces over an HTTP API.
//!
//! Usage:
//!   scripthost serve [--port 8080]        # Start HTTP server
//!   scripthost cleanup-env --user <id>    # Remove a user's virtual environment

use clap::{Parser, Subcommand};
use scripthost::config::Config;
use scripthost::installer::remove_environment;
use scripthost::state::AppState;
use scripthost::workspace::{UserId, WorkspaceStore};
use std::process::exit;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scripthost")]
#[command(about = "Per-user script hosting with an HTTP API")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "SCRIPTHOST_PORT", default_value = "8080")]
        port: u16,
    },
    /// Remove one user's virtual environment
    CleanupEnv {
        /// User id whose environment is removed
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Cli { mut config, command } = Cli::parse();

    if let Err(e) = std::fs::create_dir_all(&config.root) {
        error!(root = %config.root.display(), error = %e, "Cannot create data root");
        exit(1);
    }
    match config.root.canonicalize() {
        Ok(root) => config.root = root,
        Err(e) => {
            error!(root = %config.root.display(), error = %e, "Cannot resolve data root");
            exit(1);
        }
    }

    match command {
        Commands::Serve { port } => {
            if config.allowed_users.is_empty() {
                warn!("No allow-list configured, every user id is accepted");
            }
            info!(root = %config.root.display(), python = %config.python.display(), "Configuration loaded");
            let state = AppState::new(config);
            if let Err(e) = scripthost::http_server::run_server(port, state).await {
                error!("Server error: {e}");
                exit(1);
            }
        }
        Commands::CleanupEnv { user } => {
            let result = UserId::parse(&user)
                .and_then(|user| WorkspaceStore::new(config.root.clone()).workspace_of(&user))
                .map_err(|e| e.to_string())
                .and_then(|ws| remove_environment(&ws).map_err(|e| e.to_string()));
            match result {
                Ok(true) => info!(%user, "Virtual environment removed"),
                Ok(false) => info!(%user, "No virtual environment to remove"),
                Err(e) => {
                    error!(%user, "Cleanup failed: {e}");
                    exit(1);
                }
            }
        }
    }
}
