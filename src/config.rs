use std::collections::HashMap;

use crate::error::{AppError, Result};

/// Upper bound on a single resolution source request (seconds).
pub const SOURCE_TIMEOUT_SECS: u64 = 10;

/// Item lock TTL: covers one resolve plus persistence for a single watch item.
pub const ITEM_LOCK_TTL_SECS: u64 = 60;

/// Purchase lock TTL: held for the whole out-of-process purchase execution.
pub const PURCHASE_LOCK_TTL_SECS: u64 = 15 * 60;

/// Added to the cycle budget to form the cycle lock TTL, so a crashed cycle
/// frees the lock shortly after its budget would have expired anyway.
pub const CYCLE_LOCK_GRACE_SECS: u64 = 30;

/// Consecutive replay failures after which a playbook is deactivated.
pub const PLAYBOOK_MAX_CONSECUTIVE_FAILURES: i64 = 3;

/// Step budget for one agent-driven purchase run.
pub const AGENT_MAX_STEPS: usize = 18;

/// Randomized pause between replayed actions (milliseconds, inclusive range).
pub const REPLAY_PAUSE_MS: (u64, u64) = (250, 900);

/// Wall-clock ceiling on one purchase execution inside the worker (seconds).
pub const PURCHASE_EXECUTION_TIMEOUT_SECS: u64 = 10 * 60;

/// How long a claimed job stays invisible before another worker may reclaim it.
pub const JOB_VISIBILITY_TIMEOUT_SECS: i64 = 15 * 60;

/// Base backoff between job retries (seconds); multiplied by the attempt number.
pub const JOB_RETRY_BACKOFF_SECS: i64 = 30;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// How often the scheduler cycle fires (CYCLE_INTERVAL_SECS)
    pub cycle_interval_secs: u64,
    /// Wall-clock ceiling on a single cycle (CYCLE_BUDGET_SECS)
    pub cycle_budget_secs: u64,
    /// Max items resolved in one cycle across all tenants (MAX_ITEMS_PER_CYCLE)
    pub max_items_per_cycle: usize,
    /// Max items one tenant may take in one cycle (MAX_ITEMS_PER_TENANT)
    pub max_items_per_tenant: usize,
    /// Pause between consecutive items within a cycle (INTER_ITEM_DELAY_MS)
    pub inter_item_delay_ms: u64,
    /// Tier minimum poll interval; configured intervals below this are raised (MIN_POLL_INTERVAL_SECS)
    pub min_poll_interval_secs: i64,
    /// Concurrent purchase sessions allowed per tenant (MAX_CONCURRENT_PURCHASES)
    pub max_concurrent_purchases: u64,
    /// Width of the dispatch dedup bucket (DEDUP_WINDOW_SECS)
    pub dedup_window_secs: i64,
    /// Delivery attempts before a job is dead-lettered (JOB_MAX_ATTEMPTS)
    pub job_max_attempts: i64,
    pub worker_concurrency: usize,
    pub worker_poll_ms: u64,
    /// Base URL of the core's HTTP surface, used by the worker (CALLBACK_URL)
    pub callback_url: String,
    /// Shared secret for the callback sink; unchecked when unset (CALLBACK_TOKEN)
    pub callback_token: Option<String>,
    pub browser_service_url: String,
    pub browser_service_token: Option<String>,
    pub vision_api_url: String,
    pub vision_api_key: Option<String>,
    pub vision_model: String,
    pub vault_url: String,
    pub vault_token: Option<String>,
    /// Structured-source API keys per retailer (RETAILER_API_KEYS, "target=abc,walmart=xyz")
    pub retailer_api_keys: HashMap<String, String>,
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "dropwatch.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            cycle_interval_secs: std::env::var("CYCLE_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .unwrap_or(60),
            cycle_budget_secs: std::env::var("CYCLE_BUDGET_SECS")
                .unwrap_or_else(|_| "50".to_string())
                .parse::<u64>()
                .unwrap_or(50),
            max_items_per_cycle: std::env::var("MAX_ITEMS_PER_CYCLE")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<usize>()
                .unwrap_or(100),
            max_items_per_tenant: std::env::var("MAX_ITEMS_PER_TENANT")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<usize>()
                .unwrap_or(10),
            inter_item_delay_ms: std::env::var("INTER_ITEM_DELAY_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse::<u64>()
                .unwrap_or(250),
            min_poll_interval_secs: std::env::var("MIN_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<i64>()
                .unwrap_or(60),
            max_concurrent_purchases: std::env::var("MAX_CONCURRENT_PURCHASES")
                .unwrap_or_else(|_| "2".to_string())
                .parse::<u64>()
                .unwrap_or(2),
            dedup_window_secs: std::env::var("DEDUP_WINDOW_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse::<i64>()
                .map_err(|_| AppError::Config("DEDUP_WINDOW_SECS must be an integer".to_string()))?
                .max(1),
            job_max_attempts: std::env::var("JOB_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse::<i64>()
                .unwrap_or(3),
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse::<usize>()
                .unwrap_or(2)
                .max(1),
            worker_poll_ms: std::env::var("WORKER_POLL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse::<u64>()
                .unwrap_or(1000),
            callback_url: std::env::var("CALLBACK_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            callback_token: non_empty_var("CALLBACK_TOKEN"),
            browser_service_url: std::env::var("BROWSER_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:9222".to_string()),
            browser_service_token: non_empty_var("BROWSER_SERVICE_TOKEN"),
            vision_api_url: std::env::var("VISION_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            vision_api_key: non_empty_var("VISION_API_KEY"),
            vision_model: std::env::var("VISION_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            vault_url: std::env::var("VAULT_URL")
                .unwrap_or_else(|_| "http://localhost:8200".to_string()),
            vault_token: non_empty_var("VAULT_TOKEN"),
            retailer_api_keys: parse_key_pairs(&std::env::var("RETAILER_API_KEYS").unwrap_or_default()),
            user_agent: std::env::var("USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
        })
    }

    pub fn cycle_lock_ttl_secs(&self) -> u64 {
        self.cycle_budget_secs + CYCLE_LOCK_GRACE_SECS
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse `"a=1,b=2"` into a map. Malformed pairs are skipped.
pub fn parse_key_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                None
            } else {
                Some((k.to_lowercase(), v.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
impl Config {
    /// Defaults used across module tests; no environment access.
    pub fn for_tests() -> Self {
        Self {
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            cycle_interval_secs: 60,
            cycle_budget_secs: 50,
            max_items_per_cycle: 100,
            max_items_per_tenant: 10,
            inter_item_delay_ms: 0,
            min_poll_interval_secs: 60,
            max_concurrent_purchases: 2,
            dedup_window_secs: 300,
            job_max_attempts: 3,
            worker_concurrency: 1,
            worker_poll_ms: 10,
            callback_url: "http://localhost:3000".to_string(),
            callback_token: None,
            browser_service_url: "http://localhost:9222".to_string(),
            browser_service_token: None,
            vision_api_url: "http://localhost:1".to_string(),
            vision_api_key: None,
            vision_model: "test".to_string(),
            vault_url: "http://localhost:8200".to_string(),
            vault_token: None,
            retailer_api_keys: HashMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}
