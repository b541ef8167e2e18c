//! webterm-server: browser terminal gateway.
//!
//! Accepts WebSocket connections from browsers, opens an SSH shell on the
//! host named in the connection URL, and relays keystrokes, resizes and
//! output between the two.

mod channel;
mod config;
mod server;
mod session;
mod transport;

#[cfg(test)]
mod testing;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::Gateway;
use session::SshConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// webterm-server: browser to SSH terminal gateway
#[derive(Parser, Debug)]
#[command(name = "webterm-server", version, about = "Browser terminal gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.webterm/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// SSH dial and authentication timeout in seconds
    #[arg(long)]
    ssh_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        max_sessions: cli.max_sessions,
        ssh_timeout: cli.ssh_timeout,
        log_level: cli.log_level,
    };
    let config = ServerConfig::load(Some(&config_path), overrides);

    // RUST_LOG wins over the configured level.
    use tracing_subscriber::EnvFilter;
    let level = match &config {
        Ok(cfg) => cfg.log_level.clone(),
        Err(_) => "info".to_string(),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %cli.config, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        max_sessions = config.max_sessions,
        "starting webterm-server"
    );

    let connector = Arc::new(SshConnector::new(&config.ssh));
    let gateway = Arc::new(Gateway::new(&config, connector));

    tokio::select! {
        result = gateway.clone().run(&config) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    gateway.shutdown().await;
    info!("webterm-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
