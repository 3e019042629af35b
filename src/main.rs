use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dropwatch::api::health::HealthState;
use dropwatch::api::routes::{router, ApiState};
use dropwatch::config::{Config, SOURCE_TIMEOUT_SECS};
use dropwatch::credentials::HttpVault;
use dropwatch::db;
use dropwatch::db::activity::ActivityLog;
use dropwatch::db::writer::ActivityWriter;
use dropwatch::dispatch::SqliteQueue;
use dropwatch::error::Result;
use dropwatch::locks::{LockManager, SqliteLockStore};
use dropwatch::resolver::fetch::ReqwestFetcher;
use dropwatch::resolver::latency::LatencyStats;
use dropwatch::resolver::Resolver;
use dropwatch::scheduler::Scheduler;

/// Buffered activity rows awaiting the background writer.
const ACTIVITY_CHANNEL_CAPACITY: usize = 1_024;

/// How often expired lock rows and session slots are purged.
const LOCK_PURGE_INTERVAL_SECS: u64 = 300;

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
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Activity log writer ---
    let (activity_tx, activity_rx) = mpsc::channel(ACTIVITY_CHANNEL_CAPACITY);
    let writer = ActivityWriter::new(pool.clone(), activity_rx);
    tokio::spawn(async move { writer.run().await });
    let activity = ActivityLog::new(activity_tx);

    // --- Locks (shared with other processes through the database) ---
    let lock_store = Arc::new(SqliteLockStore::new(pool.clone()));
    let locks = LockManager::new(lock_store.clone());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(LOCK_PURGE_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match lock_store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "Expired lock rows removed"),
                Err(e) => warn!("Lock purge failed: {e}"),
            }
        }
    });

    // --- Collaborators ---
    let latency = Arc::new(LatencyStats::new());
    let fetcher = ReqwestFetcher::new(&cfg.user_agent, Duration::from_secs(SOURCE_TIMEOUT_SECS))?;
    let resolver = Resolver::new(Arc::new(fetcher), latency.clone(), cfg.retailer_api_keys.clone());
    let vault = HttpVault::new(&cfg.vault_url, cfg.vault_token.clone())?;
    let queue = SqliteQueue::new(pool.clone(), cfg.job_max_attempts);
    let health = Arc::new(HealthState::new());

    if cfg.retailer_api_keys.is_empty() {
        warn!("RETAILER_API_KEYS not set; keyed structured sources are skipped, resolution leans on page fallback");
    }

    // --- Scheduler ---
    let scheduler = Arc::new(Scheduler::new(
        cfg.clone(),
        pool.clone(),
        resolver,
        locks.clone(),
        Arc::new(vault),
        Arc::new(queue.clone()),
        activity.clone(),
        health.clone(),
    ));
    let cycle_driver = Arc::clone(&scheduler);
    tokio::spawn(async move { cycle_driver.run().await });
    info!(
        interval_secs = cfg.cycle_interval_secs,
        budget_secs = cfg.cycle_budget_secs,
        "Scheduler started",
    );

    // --- HTTP API server ---
    let api_state = ApiState {
        pool,
        scheduler,
        locks,
        activity,
        health,
        latency,
        queue,
        callback_token: cfg.callback_token.clone(),
    };
    if cfg.callback_token.is_none() {
        warn!("CALLBACK_TOKEN not set, purchase callbacks are accepted unauthenticated");
    }
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
