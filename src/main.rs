mod api;
mod classify;
mod config;
mod currency;
mod db;
mod error;
mod executor;
mod fetch;
mod filters;
mod notify;
mod registry;
mod scheduler;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::classify::TitleKeywordClassifier;
use crate::config::{Config, PURGE_INTERVAL_SECS};
use crate::currency::CurrencyConverter;
use crate::db::SeenStore;
use crate::error::Result;
use crate::executor::PollExecutor;
use crate::fetch::VintedFetcher;
use crate::notify::discord::DiscordNotifier;
use crate::notify::Dispatcher;
use crate::registry::WatchRegistry;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(&cfg.db_path)
        .create_if_missing(true);
    let pool = sqlx::SqlitePool::connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);
    let store = SeenStore::new(pool);

    // --- Watch registry ---
    let registry = Arc::new(WatchRegistry::load(cfg.watches_file.clone())?);
    if registry.snapshot().is_empty() {
        warn!(
            file = %cfg.watches_file,
            "No active watches configured; nothing will be polled until a reload"
        );
    }
    if cfg.default_webhook.is_none() {
        warn!("DISCORD_WEBHOOK_URL not set — watches without their own webhook cannot notify");
    }

    // --- Capabilities ---
    let fetcher = Arc::new(VintedFetcher::new()?);
    let dispatcher = Dispatcher::new(Arc::new(DiscordNotifier::new(cfg.disable_images)));
    let converter = Arc::new(CurrencyConverter::new(cfg.currency_api_url.clone()));
    let executor = Arc::new(PollExecutor::new(
        fetcher,
        Some(Arc::new(TitleKeywordClassifier)),
        dispatcher,
        store.clone(),
        Some(converter),
        cfg.default_webhook.clone(),
        cfg.max_pages_per_poll,
    ));

    // --- Scheduler ---
    let scheduler = Scheduler::new(registry.clone(), executor, cfg.concurrency);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));

    // --- Seen-record retention sweep ---
    let purge_store = store.clone();
    let retention_days = cfg.seen_retention_days;
    let mut purge_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(PURGE_INTERVAL_SECS));
        ticker.tick().await; // the first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match purge_store.purge_older_than(retention_days).await {
                        Ok(0) => {}
                        Ok(n) => info!(purged = n, "Purged expired seen records"),
                        Err(e) => warn!("Seen-record purge failed: {e}"),
                    }
                }
                _ = purge_shutdown.changed() => {
                    if *purge_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // --- HTTP control surface ---
    let api_state = ApiState {
        scheduler: scheduler.clone(),
        registry,
        store,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Control API listening on {bind_addr}");

    let mut server_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("HTTP server error: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop scheduling and wait for in-flight polls to drain.
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task ended abnormally: {e}");
    }
    let _ = server_task.await;
    info!("Shutdown complete");
    Ok(())
}
