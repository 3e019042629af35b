use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::db::activity::{self, ActivityLog};
use crate::db::attempts::{self, Transition};
use crate::db::models::{ActivityRow, PurchaseEventRow};
use crate::dispatch::worker::CallbackReport;
use crate::dispatch::SqliteQueue;
use crate::error::AppError;
use crate::locks::LockManager;
use crate::resolver::latency::{LatencyStats, LatencySummary};
use crate::scheduler::{CycleReport, Scheduler};
use crate::types::{now_secs, ActivityKind, PurchaseAttempt, PurchaseStatus};

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
    pub scheduler: Arc<Scheduler>,
    pub locks: LockManager,
    pub activity: ActivityLog,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub queue: SqliteQueue,
    pub callback_token: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/callbacks/purchase", post(post_purchase_callback))
        .route("/cycle/run", post(post_cycle_run))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/attempts/:id", get(get_attempt))
        .route("/items/:id/activity", get(get_item_activity))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CallbackAck {
    pub applied: bool,
    pub status: PurchaseStatus,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub cycles: HealthSnapshot,
    pub queue_pending: i64,
}

#[derive(Serialize)]
pub struct AttemptResponse {
    #[serde(flatten)]
    pub attempt: PurchaseAttempt,
    pub events: Vec<PurchaseEventRow>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Worker progress and results. Duplicate or reordered reports are accepted
/// and ignored, so the worker can redeliver safely.
async fn post_purchase_callback(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(report): Json<CallbackReport>,
) -> Result<Json<CallbackAck>, AppError> {
    if let Some(expected) = &state.callback_token {
        let given = headers.get("x-callback-token").and_then(|v| v.to_str().ok());
        if given != Some(expected.as_str()) {
            warn!(attempt = %report.attempt_id, "[CALLBACK] Rejected report with bad token");
            return Err(AppError::Callback("invalid callback token".to_string()));
        }
    }

    let attempt = attempts::get(&state.pool, &report.attempt_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("purchase attempt {}", report.attempt_id)))?;
    if attempt.watch_item_id != report.watch_item_id || attempt.tenant_id != report.tenant_id {
        return Err(AppError::BadRequest("report does not match attempt".to_string()));
    }

    let transition = attempts::apply(&state.pool, &report.attempt_id, &report.outcome, report.terminal, now_secs()).await?;

    // A final report always frees the item, whatever state the attempt
    // reached, so the next restock can trigger again.
    if report.terminal {
        state
            .locks
            .force_release(&LockManager::purchase_key(&report.watch_item_id))
            .await;
    }

    let ack = match transition {
        Transition::Applied { from } => {
            info!(
                attempt = %report.attempt_id,
                from = %from,
                to = %report.outcome.status,
                terminal = report.terminal,
                "[CALLBACK] Attempt updated",
            );
            let (kind, message) = describe(&report);
            state.activity.record(&report.watch_item_id, &report.tenant_id, kind, message);
            CallbackAck { applied: true, status: report.outcome.status }
        }
        Transition::Ignored { current } => {
            info!(
                attempt = %report.attempt_id,
                current = %current,
                reported = %report.outcome.status,
                "[CALLBACK] Stale report ignored",
            );
            CallbackAck { applied: false, status: current }
        }
    };
    Ok(Json(ack))
}

fn describe(report: &CallbackReport) -> (ActivityKind, String) {
    let o = &report.outcome;
    let reason = o.failure_reason.as_deref().unwrap_or("no reason given");
    match o.status {
        PurchaseStatus::Success => {
            let order = o.order_ref.as_deref().unwrap_or("unknown");
            let total = o.total_price.map(|t| format!(" for ${t:.2}")).unwrap_or_default();
            (ActivityKind::PurchaseSucceeded, format!("order {order} placed{total}"))
        }
        PurchaseStatus::Failed | PurchaseStatus::Cancelled => {
            (ActivityKind::PurchaseFailed, format!("purchase {}: {reason}", o.status))
        }
        PurchaseStatus::Carted if report.terminal => (
            ActivityKind::PurchaseNeedsReview,
            format!("item carted but order not confirmed: {reason}"),
        ),
        status => (ActivityKind::PurchaseProgress, format!("purchase reached {status}")),
    }
}

async fn post_cycle_run(State(state): State<ApiState>) -> Result<Json<CycleReport>, AppError> {
    match state.scheduler.run_cycle().await? {
        Some(report) => Ok(Json(report)),
        None => Err(AppError::Conflict("a scheduler cycle is already running".to_string())),
    }
}

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let queue_pending = state.queue.pending_count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        cycles: state.health.snapshot(),
        queue_pending,
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<Vec<LatencySummary>> {
    Json(state.latency.summaries())
}

async fn get_attempt(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<AttemptResponse>, AppError> {
    let attempt = attempts::get(&state.pool, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("purchase attempt {id}")))?;
    let events = attempts::events(&state.pool, &id).await?;
    Ok(Json(AttemptResponse { attempt, events }))
}

async fn get_item_activity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(activity::list_for_item(&state.pool, &id, limit).await?))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::credentials::testing::StaticVault;
    use crate::db::test_pool;
    use crate::dispatch::PurchaseJob;
    use crate::locks::MemoryLockStore;
    use crate::resolver::testing::FakeFetch;
    use crate::resolver::Resolver;
    use crate::types::PurchaseOutcome;

    async fn state(token: Option<&str>) -> (ApiState, Arc<MemoryLockStore>) {
        let pool = test_pool().await;
        let store = Arc::new(MemoryLockStore::new());
        let locks = LockManager::new(store.clone());
        let (tx, _rx) = mpsc::channel(64);
        let activity = ActivityLog::new(tx);
        let health = Arc::new(HealthState::new());
        let latency = Arc::new(LatencyStats::new());
        let queue = SqliteQueue::new(pool.clone(), 3);
        let scheduler = Scheduler::new(
            Config::for_tests(),
            pool.clone(),
            Resolver::new(Arc::new(FakeFetch::default()), latency.clone(), HashMap::new()),
            locks.clone(),
            Arc::new(StaticVault::default()),
            Arc::new(queue.clone()),
            activity.clone(),
            health.clone(),
        );
        let state = ApiState {
            pool,
            scheduler: Arc::new(scheduler),
            locks,
            activity,
            health,
            latency,
            queue,
            callback_token: token.map(str::to_string),
        };
        (state, store)
    }

    fn report(attempt_id: &str, outcome: PurchaseOutcome, terminal: bool) -> CallbackReport {
        let job = PurchaseJob {
            attempt_id: attempt_id.to_string(),
            watch_item_id: "w1".into(),
            tenant_id: "t1".into(),
            retailer: "generic".into(),
            product_locator: "https://shop.example/p/1".into(),
            quantity: 1,
            price_ceiling: None,
        };
        CallbackReport::new(&job, outcome, terminal)
    }

    fn headers(token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-callback-token", token.parse().unwrap());
        h
    }

    #[tokio::test]
    async fn terminal_callback_applies_once_and_frees_the_item() {
        let (state, store) = state(Some("s3cret")).await;
        let attempt = attempts::create(&state.pool, "t1", "w1", 1).await.unwrap();
        let key = LockManager::purchase_key("w1");
        assert!(state.locks.acquire(&key, Duration::from_secs(60)).await);

        let done = PurchaseOutcome::success(Some("ORD-9".into()), Some(30.0), vec![]);
        let Json(ack) = post_purchase_callback(
            State(state.clone()),
            headers("s3cret"),
            Json(report(&attempt.id, done.clone(), true)),
        )
        .await
        .unwrap();
        assert_eq!(ack, CallbackAck { applied: true, status: PurchaseStatus::Success });
        assert!(LockManager::new(store).acquire(&key, Duration::from_secs(60)).await);

        let Json(again) = post_purchase_callback(
            State(state.clone()),
            headers("s3cret"),
            Json(report(&attempt.id, done, true)),
        )
        .await
        .unwrap();
        assert!(!again.applied);
        assert_eq!(attempts::events(&state.pool, &attempt.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn progress_report_keeps_the_purchase_lock() {
        let (state, store) = state(None).await;
        let attempt = attempts::create(&state.pool, "t1", "w1", 1).await.unwrap();
        let key = LockManager::purchase_key("w1");
        assert!(state.locks.acquire(&key, Duration::from_secs(60)).await);

        let carted = PurchaseOutcome { status: PurchaseStatus::Carted, order_ref: None, total_price: None, failure_reason: None, steps_completed: vec![] };
        post_purchase_callback(State(state.clone()), HeaderMap::new(), Json(report(&attempt.id, carted, false)))
            .await
            .unwrap();

        assert!(!LockManager::new(store).acquire(&key, Duration::from_secs(60)).await);
        let stored = attempts::get(&state.pool, &attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Carted);
    }

    #[tokio::test]
    async fn unconfirmed_ending_after_payment_progress_is_recorded() {
        let (state, store) = state(None).await;
        let attempt = attempts::create(&state.pool, "t1", "w1", 1).await.unwrap();
        let key = LockManager::purchase_key("w1");
        assert!(state.locks.acquire(&key, Duration::from_secs(60)).await);

        let paying = PurchaseOutcome { status: PurchaseStatus::CheckoutPayment, order_ref: None, total_price: None, failure_reason: None, steps_completed: vec![] };
        post_purchase_callback(State(state.clone()), HeaderMap::new(), Json(report(&attempt.id, paying, false)))
            .await
            .unwrap();

        let ended = PurchaseOutcome::carted_unconfirmed("order not confirmed after submit", vec![]);
        let Json(ack) = post_purchase_callback(
            State(state.clone()),
            HeaderMap::new(),
            Json(report(&attempt.id, ended, true)),
        )
        .await
        .unwrap();
        assert_eq!(ack, CallbackAck { applied: true, status: PurchaseStatus::Carted });

        let stored = attempts::get(&state.pool, &attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Carted);
        assert_eq!(stored.failure_reason.as_deref(), Some("order not confirmed after submit"));
        let events = attempts::events(&state.pool, &attempt.id).await.unwrap();
        assert_eq!(events.last().map(|e| e.to_status.as_str()), Some("carted"));
        assert!(LockManager::new(store).acquire(&key, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn bad_token_is_rejected_before_any_write() {
        let (state, _) = state(Some("s3cret")).await;
        let attempt = attempts::create(&state.pool, "t1", "w1", 1).await.unwrap();

        let result = post_purchase_callback(
            State(state.clone()),
            headers("guess"),
            Json(report(&attempt.id, PurchaseOutcome::failed("x", vec![]), true)),
        )
        .await;
        assert!(matches!(result, Err(AppError::Callback(_))));
        let stored = attempts::get(&state.pool, &attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Detected);
    }

    #[tokio::test]
    async fn cycle_endpoint_conflicts_while_locked() {
        let (state, store) = state(None).await;
        let other = LockManager::new(store);
        assert!(other.acquire(&LockManager::cycle_key(), Duration::from_secs(30)).await);

        let result = post_cycle_run(State(state.clone())).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));

        other.release(&LockManager::cycle_key()).await;
        let Json(report) = post_cycle_run(State(state.clone())).await.unwrap();
        assert_eq!(report.selected, 0);
        assert_eq!(state.health.snapshot().cycles_run, 1);
        assert_eq!(state.health.snapshot().cycles_skipped, 1);
    }
}
