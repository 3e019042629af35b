//! Out-of-process purchase worker. Shares the database with the core for
//! the job queue, playbooks and attempt status; reports results over HTTP.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dropwatch::automation::browser::RemoteBrowser;
use dropwatch::automation::vision::OpenAiVision;
use dropwatch::automation::Engine;
use dropwatch::config::Config;
use dropwatch::credentials::HttpVault;
use dropwatch::db;
use dropwatch::dispatch::worker::{CallbackClient, Worker};
use dropwatch::dispatch::SqliteQueue;
use dropwatch::error::{AppError, Result};
use dropwatch::playbook::PlaybookStore;

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
    let api_key = cfg
        .vision_api_key
        .clone()
        .ok_or_else(|| AppError::Config("VISION_API_KEY is required by the purchase worker".to_string()))?;

    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Engine ---
    let browser = RemoteBrowser::new(&cfg.browser_service_url, cfg.browser_service_token.clone())?;
    let vision = OpenAiVision::new(&cfg.vision_api_url, api_key, cfg.vision_model.clone())?;
    let vault = HttpVault::new(&cfg.vault_url, cfg.vault_token.clone())?;
    let engine = Engine::new(
        Arc::new(browser),
        Arc::new(vision),
        Arc::new(vault),
        PlaybookStore::new(pool.clone()),
    );

    // --- Worker ---
    let queue = SqliteQueue::new(pool.clone(), cfg.job_max_attempts);
    let reporter = CallbackClient::new(&cfg.callback_url, cfg.callback_token.clone())?;
    let worker = Arc::new(Worker::new(
        Arc::new(queue),
        Arc::new(engine),
        Arc::new(reporter),
        pool,
        cfg.worker_concurrency,
        Duration::from_millis(cfg.worker_poll_ms),
    ));
    info!(
        browser = %cfg.browser_service_url,
        callback = %cfg.callback_url,
        model = %cfg.vision_model,
        "Purchase worker ready",
    );

    tokio::select! {
        _ = worker.run() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutdown requested, leases on in-flight jobs will lapse and redeliver");
        }
    }
    Ok(())
}
