use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coop_authority_server::anticheat::validator::select_validator;
use coop_authority_server::catalog::{Catalog, StaticCatalog};
use coop_authority_server::config::ServerConfig;
use coop_authority_server::metrics::{self, Metrics};
use coop_authority_server::net::game_session::{start_game_loop, GameSession, SessionDeps};
use coop_authority_server::net::tcp::TcpTransport;
use coop_authority_server::persistence::{BlobStore, FileStore, MemoryStore, WorldPersistence};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Co-op Authority Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {}:{}, max_connections={}, tick_rate={}",
        config.bind_address, config.port, config.max_connections, config.tick_rate
    );

    let catalog: Arc<dyn Catalog> = match &config.catalog_path {
        Some(path) => Arc::new(
            StaticCatalog::load(path)
                .with_context(|| format!("loading catalog {}", path.display()))?,
        ),
        None => {
            warn!("CATALOG_PATH not set; running with an empty catalog");
            Arc::new(StaticCatalog::default())
        }
    };

    let store: Arc<dyn BlobStore> = match &config.save_dir {
        Some(dir) => Arc::new(FileStore::new(dir)?),
        None => {
            warn!("SAVE_DIR not set; world record kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let persistence = Arc::new(WorldPersistence::load(store)?);
    let validator = select_validator(config.anticheat);

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());
    if config.metrics_port != 0 {
        let metrics_clone = metrics.clone();
        let metrics_port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let addr = SocketAddr::new(config.bind_address, config.port);
    let (transport, acceptor, events) = TcpTransport::bind(addr, config.max_connections).await?;

    let tick_duration = config.tick_duration();
    let session = Arc::new(Mutex::new(GameSession::new(SessionDeps {
        config,
        catalog,
        persistence,
        validator,
        transport,
        events,
        metrics: metrics.clone(),
    })));
    let game_loop = start_game_loop(session.clone(), tick_duration, metrics);

    info!("Server ready on {}", addr);

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    // Run server with graceful shutdown
    tokio::select! {
        result = acceptor.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Cleanup
    game_loop.abort();
    session.lock().shutdown();
    info!("Server stopped");

    Ok(())
}
