use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::config::Config;
use wakegate::forward::{HttpForwarder, PoolConfig};
use wakegate::gate::RequestGate;
use wakegate::notify::SessionNotifier;
use wakegate::probe::TcpProber;
use wakegate::proxy::ProxyServer;
use wakegate::wake::WakeCoordinator;
use wakegate::wol::MagicPacketSignaler;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, PartialEq)]
struct Args {
    config_path: PathBuf,
    port: Option<u16>,
}

fn parse_args<I>(args: I) -> anyhow::Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut config_path = PathBuf::from("config.json");
    let mut port = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("{} requires a path", arg))?;
                config_path = PathBuf::from(value);
            }
            "--port" | "-p" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("{} requires a port", arg))?;
                port = Some(
                    value
                        .parse()
                        .map_err(|e| anyhow::anyhow!("Invalid port '{}': {}", value, e))?,
                );
            }
            other => anyhow::bail!("Unknown argument '{}' (usage: {} [--config <path>] [--port <port>])", other, PKG_NAME),
        }
    }

    Ok(Args { config_path, port })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse().expect("valid log directive")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    let config = Config::load(&args.config_path).map_err(|e| {
        error!(path = %args.config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %args.config_path.display(), "Configuration successfully loaded");

    let listen_port = args.port.unwrap_or(config.listen_port);
    let bind_addr: SocketAddr = format!("{}:{}", config.bind, listen_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.bind, port = listen_port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    print_startup_banner(&config, bind_addr);

    let notifier = Arc::new(SessionNotifier::new(
        config.backend_base_url.clone(),
        config.api_key.clone(),
        config.message_timeout_ms,
        config.notify_timeout(),
    )?);

    let coordinator = Arc::new(WakeCoordinator::new(
        config.wake_target(),
        notifier,
        Arc::new(MagicPacketSignaler::new()),
        config.wake_messages(),
    ));

    let gate = Arc::new(RequestGate::new(
        config.trigger_set(),
        config.probe_address(),
        Arc::new(TcpProber::new(config.probe_timeout())),
        coordinator,
        config.wait_policy(),
    ));

    let forwarder = Arc::new(HttpForwarder::new(
        config.forward_address(),
        PoolConfig {
            max_idle_per_host: config.pool_max_idle,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        },
        config.request_timeout(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(bind_addr, gate, forwarder, shutdown_rx);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, bind_addr: SocketAddr) {
    info!(name = PKG_NAME, version = VERSION, "Starting app");
    info!(
        listen = %bind_addr,
        forward = %config.forward_address(),
        probe = %config.probe_address(),
        "Gateway configuration"
    );
    info!(
        mac = %config.mac_address,
        broadcast = %config.broadcast_address,
        poll_interval_ms = config.poll_interval_ms,
        wake_timeout_secs = config.wake_timeout_secs,
        "Wake settings"
    );
    info!(
        trigger_count = config.wake_trigger_endpoints.len(),
        triggers = ?config.wake_trigger_endpoints,
        "Wake trigger endpoints"
    );
}
