//! persh-server: persistent shell session server.

use anyhow::Context;
use clap::Parser;
use persh_core::RcCustomizer;
use persh_server::{CliOverrides, PershServer, ServerConfig, SessionRegistry};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// persh-server: persistent shell sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "persh-server", version, about = "Persistent shell session server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.persh/config.toml")]
    config: String,

    /// Shell to launch for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Scrollback kept per session, in bytes
    #[arg(long)]
    scrollback_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting persh-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        shell: cli.shell,
        max_sessions: cli.max_sessions,
        scrollback_bytes: cli.scrollback_bytes,
    };
    let config = ServerConfig::load(Some(&config_path), overrides)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    let customizer = Arc::new(RcCustomizer::new(config.rc_dir.clone()));
    let registry = Arc::new(SessionRegistry::new(config.session.clone(), customizer));
    let server = PershServer::new(config, registry.clone());

    let result = tokio::select! {
        result = server.run() => result.context("server error"),
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    registry.close_all().await;
    info!("persh-server stopped");
    result
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
