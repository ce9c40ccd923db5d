use anyhow::Context;
use carp_failover::http::HttpServer;
use carp_failover::{Collaborators, Engine, EngineConfig, Subscriber};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "/usr/local/etc/carp-failover.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("carp-failoverd v{}", carp_failover::version());

    let path = std::env::args().nth(1);
    let settings = match path.as_deref() {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading daemon configuration from {}", path))?,
        None if Path::new(DEFAULT_CONFIG).exists() => EngineConfig::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("loading daemon configuration from {}", DEFAULT_CONFIG))?,
        None => {
            warn!("No configuration at {}, using defaults", DEFAULT_CONFIG);
            EngineConfig::default()
        }
    };

    let deps = Collaborators::production(&settings).context("building collaborators")?;
    let engine = Arc::new(Engine::new(settings.clone(), deps).context("starting engine")?);

    if let Some(at) = engine.check_watchdog_alert().await {
        warn!("Previous boot ended in a watchdog reset at {}", at);
    }
    info!("Initial failover status: {}", engine.refresh_status().await);

    let subscriber = Arc::new(Subscriber::new(Arc::clone(&engine)));

    let server = HttpServer::new(
        Arc::clone(&subscriber),
        settings.http.address.clone(),
        settings.http.port,
    );
    let http = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("HTTP server error: {}", e);
        }
    });

    let feed = settings.paths.event_fifo.clone().map(|fifo| {
        let subscriber = Arc::clone(&subscriber);
        tokio::spawn(async move {
            if let Err(e) = subscriber.run_fifo(&fifo).await {
                error!("Event feed {} failed: {}", fifo.display(), e);
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    http.abort();
    if let Some(feed) = feed {
        feed.abort();
    }
    Ok(())
}
