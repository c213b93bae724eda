//! metaconn - Client Connection Layer of a Metadata Server
//!
//! This is the main entry point for the metaconn server.
//! It loads the configuration, starts the worker pool and the client
//! listener, and handles shutdown and reload signals.

use anyhow::Context;
use clap::Parser;
use metaconn::config::{reload_policy, shared_policy, Policy, Properties, ServerConfig};
use metaconn::server::Server;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "metaconn", version, about = "Metadata server client connection layer")]
struct Cli {
    /// Properties file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host to bind to (overrides metaServer.clientHost)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides metaServer.clientPort)
    #[arg(short, long)]
    port: Option<u16>,

    /// Set a property, e.g. -D metaServer.clientSM.maxPendingOps=16
    #[arg(short = 'D', long = "define", value_name = "NAME=VALUE")]
    defines: Vec<String>,
}

/// Reads the properties file, then applies `-D` definitions on top.
fn load_properties(path: Option<&Path>, defines: &[String]) -> anyhow::Result<Properties> {
    let mut props = match path {
        Some(path) => Properties::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => Properties::new(),
    };
    for definition in defines {
        props.define(definition)?;
    }
    Ok(props)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let props = load_properties(cli.config.as_deref(), &cli.defines)?;
    let mut config = ServerConfig::from_properties(&props);
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let policy = Policy::default().with_properties(&props);
    info!(
        version = metaconn::VERSION,
        properties = props.len(),
        policy = ?policy,
        "Configuration loaded"
    );

    let shared = shared_policy(policy);
    let server = Server::new(config, shared.clone());
    let listener = server
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", server.config().bind_address()))?;
    info!(addr = %server.config().bind_address(), "metaconn listening");

    #[cfg(unix)]
    spawn_reload_handler(cli.config.clone(), cli.defines.clone(), shared);

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    server.run(listener, shutdown).await;

    info!("Server shutdown complete");
    Ok(())
}

/// Re-reads the configuration on SIGHUP and publishes the new policy.
/// Live connections pick it up on their next turn.
#[cfg(unix)]
fn spawn_reload_handler(
    path: Option<PathBuf>,
    defines: Vec<String>,
    policy: metaconn::SharedPolicy,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler; reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match load_properties(path.as_deref(), &defines) {
                Ok(props) => {
                    let updated = reload_policy(&policy, &props);
                    info!(policy = ?updated, "Configuration reloaded");
                }
                Err(e) => warn!(error = %e, "Configuration reload failed; keeping current policy"),
            }
        }
    });
}
