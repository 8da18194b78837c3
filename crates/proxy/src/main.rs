//! MCP stdio proxy
//!
//! Expose stdio MCP servers over MCP Streamable HTTP, one subprocess per session.

use clap::Parser;
use mcp_stdio_proxy::bridge::BridgeOptions;
use mcp_stdio_proxy::config::{CliArgs, ProxyConfig, registry_table};
use mcp_stdio_proxy::gateway::{GatewaySettings, ProxyGateway};
use mcp_stdio_proxy::http::{AppState, create_router, with_request_counting};
use mcp_stdio_proxy::manager::SessionManager;
use mcp_stdio_proxy::reaper::{ReaperSettings, spawn_idle_reaper};
use mcp_stdio_proxy::registry::{ContainerEvents, StaticRegistry};
use std::io::{IsTerminal as _, stdout};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse();

    // Load configuration
    let config = ProxyConfig::load(cli)?;

    if config.cli.print_effective_config {
        let yaml = serde_yaml::to_string(&config.effective())?;
        print!("{yaml}");
        return Ok(());
    }

    // Initialize logging (effective config already includes CLI/ENV/config precedence).
    init_logging(&config.proxy.log_level);

    tracing::info!("Starting MCP stdio proxy v{}", VERSION);

    let events = ContainerEvents::new();
    let registry = Arc::new(StaticRegistry::new(
        registry_table(config.containers.clone()),
        events.clone(),
    ));
    tracing::info!(
        "Loaded {} container(s) from config",
        registry.container_count()
    );
    if registry.container_count() == 0 {
        tracing::warn!("No containers configured. Every proxy call will answer 404.");
    }

    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        BridgeOptions {
            stop_grace: config.proxy.stop_grace_duration(),
        },
    ));

    // Create cancellation token for graceful shutdown
    let ct = CancellationToken::new();

    let reaper = spawn_idle_reaper(
        manager.clone(),
        ReaperSettings {
            idle_timeout: config.proxy.idle_timeout_duration(),
            sweep_interval: config.proxy.sweep_interval_duration(),
        },
        events.subscribe(),
        ct.clone(),
    );

    #[cfg(unix)]
    spawn_reload_on_sighup(config.clone(), registry.clone(), ct.clone())?;

    let gateway = ProxyGateway::new(
        manager.clone(),
        GatewaySettings {
            call_timeout: config.proxy.call_timeout_duration(),
            sse_keep_alive: config.proxy.sse_keep_alive_duration(),
        },
    );
    let state = Arc::new(AppState::new(gateway, VERSION));
    let app = with_request_counting(create_router(state.clone()), state);

    // Parse bind address
    let addr: SocketAddr =
        config.proxy.bind.parse().map_err(|e| {
            anyhow::anyhow!("Invalid bind address '{}': {}", config.proxy.bind, e)
        })?;

    tracing::info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let ct_clone = ct.clone();

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            ct_clone.cancelled().await;
        });

        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    // Wait for shutdown signal
    shutdown_signal(manager, ct).await;
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "idle reaper task failed");
    }

    tracing::info!("Proxy shut down gracefully");
    Ok(())
}

/// Re-read the container table on SIGHUP. Containers that disappear are torn down.
#[cfg(unix)]
fn spawn_reload_on_sighup(
    config: ProxyConfig,
    registry: Arc<StaticRegistry>,
    ct: CancellationToken,
) -> anyhow::Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = ct.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match config.reload_containers() {
                        Ok(containers) => {
                            let removed = registry.replace_all(registry_table(containers));
                            tracing::info!(
                                containers = registry.container_count(),
                                removed = ?removed,
                                "Reloaded container registry"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                "Config reload failed; keeping previous registry"
                            );
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stdout is a TTY for format selection
    let is_tty = stdout().is_terminal();

    if is_tty {
        // Human-readable format for development
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        // JSON format for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal(manager: Arc<SessionManager>, ct: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Cancel the HTTP server and the reaper
    ct.cancel();

    // Stop every session subprocess
    manager.shutdown_all().await;
}
