use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardd::autoscale::{AutoSplitter, LoadMonitor, SystemCollector};
use shardd::catalog::{Catalog, RocksCatalogStore};
use shardd::config::Config;
use shardd::health::{HealthController, HealthRegistry};
use shardd::manager::ShardManager;
use shardd::pool::{ConnectionPool, PgConnector};
use shardd::reshard::{Resharder, SqlDataMover};
use shardd::router::Router as QueryRouter;
use shardd::server::{create_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "shardd")]
#[command(about = "shardd - a horizontally sharded database router", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 7450)]
    port: u16,

    /// Data directory for the catalog store
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Run the data plane only, without background controllers
    #[arg(long)]
    no_controllers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present, before anything reads the environment
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    let config = Arc::new(config);

    let catalog_path = std::path::Path::new(&args.data_dir).join("catalog");
    let store = Arc::new(RocksCatalogStore::open(&catalog_path)?);
    let catalog = Arc::new(Catalog::open(store).await?);
    info!(
        "catalog opened at {:?}, version {}",
        catalog_path,
        catalog.snapshot().version
    );

    let connector = Arc::new(PgConnector::default());
    let pool = Arc::new(ConnectionPool::new(
        connector.clone(),
        config.max_connections,
        config.connection_ttl(),
    ));
    let health = Arc::new(HealthRegistry::new());
    let router = Arc::new(QueryRouter::new(
        catalog.clone(),
        pool.clone(),
        health.clone(),
        config.clone(),
    ));
    let manager = Arc::new(ShardManager::new(
        catalog.clone(),
        connector.clone(),
        config.clone(),
    ));

    // Single shutdown signal for every background loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mover = Arc::new(SqlDataMover::new(
        pool.clone(),
        config.reshard.clone(),
        config.acquire_timeout(),
    ));
    let resharder = Arc::new(Resharder::new(
        catalog.clone(),
        mover,
        config.clone(),
        shutdown_rx.clone(),
    ));
    manager.set_resharder(resharder.clone());

    // Resume reshard jobs interrupted by a previous shutdown
    match catalog.list_jobs(None).await {
        Ok(jobs) => {
            for job in jobs.into_iter().filter(|j| !j.status.is_terminal()) {
                warn!("resuming reshard job {} from {}", job.id, job.status);
                tokio::spawn(resharder.clone().run(job.id));
            }
        }
        Err(e) => error!("could not list reshard jobs at startup: {}", e),
    }

    let monitor = Arc::new(LoadMonitor::new(
        catalog.clone(),
        Arc::new(SystemCollector::new()),
        config.clone(),
    ));

    let mut controller_handles = Vec::new();
    if !args.no_controllers {
        let health_controller = Arc::new(HealthController::new(
            catalog.clone(),
            connector.clone(),
            manager.clone(),
            health.clone(),
            config.clone(),
        ));
        controller_handles.push(tokio::spawn(
            health_controller.run(shutdown_rx.clone()),
        ));

        controller_handles.push(tokio::spawn(monitor.clone().run(shutdown_rx.clone())));

        let splitter = Arc::new(AutoSplitter::new(
            catalog.clone(),
            monitor.clone(),
            manager.clone(),
            config.clone(),
        ));
        controller_handles.push(tokio::spawn(splitter.run(shutdown_rx.clone())));

        // Tenant usage flush loop
        {
            let router = router.clone();
            let catalog = catalog.clone();
            let config = config.clone();
            let mut shutdown = shutdown_rx.clone();
            controller_handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(config.tenant_flush_interval_secs));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = router.tenants().flush(&catalog, config.retry_attempts).await {
                                warn!("tenant usage flush failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }
        info!("background controllers started");
    }

    let state = AppState {
        catalog: catalog.clone(),
        router: router.clone(),
        manager,
        health,
        monitor,
        config: config.clone(),
        startup_time: Instant::now(),
    };
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("shardd listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Stop every controller loop and give them a bounded grace period
    let _ = shutdown_tx.send(true);
    let joined = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join_all(controller_handles),
    )
    .await;
    if joined.is_err() {
        warn!("controllers did not stop within the grace period");
    }

    // Final best-effort flush of tenant usage
    if let Err(e) = router.tenants().flush(&catalog, config.retry_attempts).await {
        warn!("final tenant usage flush failed: {}", e);
    }

    info!("shardd stopped");
    Ok(())
}
