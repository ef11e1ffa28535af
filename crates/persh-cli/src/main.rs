//! persh: client for persistent shell sessions.
//!
//! Attaches the local terminal to a session on a persh-server, creating the
//! session when no ID is given.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

/// persh: persistent shell client
#[derive(Parser)]
#[command(name = "persh", version, about = "Persistent shell client")]
struct Cli {
    /// Server host (overrides config)
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach to a session, creating one if needed
    Attach {
        /// Session ID to reattach to
        #[arg(short, long)]
        session: Option<String>,

        /// Name for a newly created session
        #[arg(short, long)]
        name: Option<String>,

        /// Working directory for a newly created session (server side)
        #[arg(long)]
        cwd: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr, which shares the raw terminal; keep them quiet by default.
    let filter = if cli.verbose {
        "persh=debug,persh_core=debug"
    } else {
        "persh=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".persh")
            .join("client.toml")
    });

    let result = async {
        let cfg = config::Config::load(&config_path)?;
        let host = cli.host.clone().unwrap_or(cfg.default.host);
        let port = cli.port.unwrap_or(cfg.default.port);

        match cli.command {
            Command::Attach { session, name, cwd } => {
                commands::attach::run(&host, port, session, name, cwd).await
            }
        }
    }
    .await;

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("persh: {e:#}");
        std::process::exit(1);
    }
}
