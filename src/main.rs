use botgate::assets::StaticAssets;
use botgate::config::Config;
use botgate::pool::{ConnectionPool, PoolConfig};
use botgate::proxy::{FrontDoor, ProxyServer};
use botgate::readiness::HttpProbe;
use botgate::registry::Registry;
use botgate::sandbox::LocalSandboxProvider;
use botgate::supervisor::{Fleet, GatewaySettings};
use botgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("botgate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("botgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let registry = Registry::open(&config.registry.path).map_err(|e| {
        error!(path = %config.registry.path.display(), error = %e, "Failed to open bot registry");
        e
    })?;

    let providers = config.providers.resolve();
    if providers.is_empty() {
        warn!("No provider credentials found; gateways will start without API keys");
    } else {
        info!(providers = ?providers.names(), "Provider credentials loaded");
    }

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));
    let pool_stats = pool.stats();

    let probe = Arc::new(HttpProbe::new(
        Arc::clone(&pool),
        config.gateway.health_path.clone(),
        config.gateway.probe_timeout(),
    ));
    let sandboxes = Arc::new(LocalSandboxProvider::new(&config.gateway));
    let fleet = Arc::new(Fleet::new(
        sandboxes,
        probe,
        GatewaySettings::from_config(&config.gateway, providers),
    ));

    let front_door = Arc::new(FrontDoor::new(
        registry,
        Arc::clone(&fleet),
        pool,
        StaticAssets::new(config.assets.dir.clone()),
        config.server.request_timeout(),
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(bind_addr, front_door, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Front door server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!(gateways = fleet.len(), "Stopping all gateways...");
    fleet.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        forwarded = pool_stats.forwarded(),
        probes = pool_stats.probes(),
        "Connection pool statistics"
    );

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting bot front door");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        dev_mode = config.dev_mode,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        registry = %config.registry.path.display(),
        assets = %config.assets.dir.display(),
        "Storage"
    );
    info!(
        command = %config.gateway.command,
        args = ?config.gateway.args,
        base_port = config.gateway.base_port,
        max_sandboxes = config.gateway.max_sandboxes,
        "Gateway launch settings"
    );
    info!(
        health_path = %config.gateway.health_path,
        poll_interval_ms = config.gateway.poll_interval_ms,
        startup_timeout_secs = config.gateway.startup_timeout_secs,
        stale_grace_secs = config.gateway.stale_grace_secs,
        "Gateway readiness settings"
    );
}
