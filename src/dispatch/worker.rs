//! Out-of-process purchase worker: claims jobs, executes them through the
//! automation engine and reports back through the callback sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::automation::{Engine, ProgressSink};
use crate::config::PURCHASE_EXECUTION_TIMEOUT_SECS;
use crate::db::attempts;
use crate::dispatch::queue::{ClaimedJob, JobQueue, NackOutcome};
use crate::dispatch::{Job, PurchaseJob};
use crate::error::{AppError, Result};
use crate::types::{now_secs, PurchaseOutcome, PurchaseStatus};

/// Body posted to the callback sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackReport {
    pub attempt_id: String,
    pub watch_item_id: String,
    pub tenant_id: String,
    /// False for progress updates.
    pub terminal: bool,
    #[serde(flatten)]
    pub outcome: PurchaseOutcome,
}

impl CallbackReport {
    pub fn new(job: &PurchaseJob, outcome: PurchaseOutcome, terminal: bool) -> Self {
        Self {
            attempt_id: job.attempt_id.clone(),
            watch_item_id: job.watch_item_id.clone(),
            tenant_id: job.tenant_id.clone(),
            terminal,
            outcome,
        }
    }
}

#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    async fn send(&self, report: &CallbackReport) -> Result<()>;
}

pub struct CallbackClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl CallbackClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/callbacks/purchase", base_url.trim_end_matches('/')),
            token,
        })
    }
}

#[async_trait]
impl OutcomeReporter for CallbackClient {
    async fn send(&self, report: &CallbackReport) -> Result<()> {
        let mut req = self.client.post(&self.url).json(report);
        if let Some(t) = &self.token {
            req = req.header("x-callback-token", t);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Callback(format!("sink returned {status}: {body}")));
        }
        Ok(())
    }
}

/// Forwards engine progress as non-terminal callbacks. Delivery failures are
/// logged only; the terminal report is what counts.
struct CallbackProgress {
    reporter: Arc<dyn OutcomeReporter>,
    job: PurchaseJob,
}

#[async_trait]
impl ProgressSink for CallbackProgress {
    async fn report(&self, status: PurchaseStatus, note: &str) {
        let outcome = PurchaseOutcome {
            status,
            order_ref: None,
            total_price: None,
            failure_reason: None,
            steps_completed: vec![note.to_string()],
        };
        let report = CallbackReport::new(&self.job, outcome, false);
        if let Err(e) = self.reporter.send(&report).await {
            warn!(attempt = %self.job.attempt_id, %status, "[WORKER] Progress callback failed: {e}");
        }
    }
}

/// In-process retries of the terminal callback before giving the job back.
const CALLBACK_RETRIES: u32 = 3;

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    engine: Arc<Engine>,
    reporter: Arc<dyn OutcomeReporter>,
    pool: SqlitePool,
    concurrency: usize,
    poll_interval: Duration,
    execution_timeout: Duration,
    callback_backoff: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        engine: Arc<Engine>,
        reporter: Arc<dyn OutcomeReporter>,
        pool: SqlitePool,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            engine,
            reporter,
            pool,
            concurrency: concurrency.max(1),
            poll_interval,
            execution_timeout: Duration::from_secs(PURCHASE_EXECUTION_TIMEOUT_SECS),
            callback_backoff: Duration::from_secs(1),
        }
    }

    /// Claim and run jobs forever, at most `concurrency` at a time.
    pub async fn run(self: Arc<Self>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        info!(concurrency = self.concurrency, "[WORKER] Started");

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                error!("[WORKER] Semaphore closed, stopping");
                return;
            };
            match self.queue.claim().await {
                Ok(Some(job)) => {
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.handle(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!("[WORKER] Claim failed: {e}");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Process one delivery. Every path ends in ack, nack or dead-letter.
    pub async fn handle(&self, claimed: ClaimedJob) {
        let job = match serde_json::from_str::<Job>(&claimed.body) {
            Ok(Job::Purchase(p)) => p,
            Err(e) => {
                self.settle_dead(&claimed.id, &format!("undecodable job: {e}")).await;
                return;
            }
        };

        if let Some(stashed) = &claimed.outcome {
            match serde_json::from_str::<PurchaseOutcome>(stashed) {
                Ok(outcome) => {
                    info!(attempt = %job.attempt_id, "[WORKER] Redelivering stored outcome");
                    self.deliver(&claimed, &job, outcome).await;
                }
                Err(e) => self.settle_dead(&claimed.id, &format!("corrupt stored outcome: {e}")).await,
            }
            return;
        }

        match attempts::get(&self.pool, &job.attempt_id).await {
            Ok(Some(a)) if a.status == PurchaseStatus::Detected => {}
            Ok(Some(a)) => {
                info!(attempt = %job.attempt_id, status = %a.status, "[WORKER] Attempt already past detected, skipping");
                self.settle_ack(&claimed.id).await;
                return;
            }
            Ok(None) => {
                self.settle_dead(&claimed.id, "purchase attempt does not exist").await;
                return;
            }
            Err(e) => {
                self.settle_nack(&claimed.id, &format!("attempt lookup failed: {e}")).await;
                return;
            }
        }

        info!(attempt = %job.attempt_id, retailer = %job.retailer, delivery = claimed.attempts, "[WORKER] Executing purchase");
        let outcome = self.execute_isolated(&job).await;
        info!(attempt = %job.attempt_id, status = %outcome.status, "[WORKER] Purchase finished");

        match serde_json::to_string(&outcome) {
            Ok(body) => {
                if let Err(e) = self.queue.stash_outcome(&claimed.id, &body).await {
                    warn!(job = %claimed.id, "[WORKER] Could not store outcome: {e}");
                }
            }
            Err(e) => warn!(job = %claimed.id, "[WORKER] Could not encode outcome: {e}"),
        }
        self.deliver(&claimed, &job, outcome).await;
    }

    /// Run the engine in its own task so a panic or overrun becomes a failed
    /// outcome instead of taking the worker down.
    async fn execute_isolated(&self, job: &PurchaseJob) -> PurchaseOutcome {
        let engine = Arc::clone(&self.engine);
        let progress = CallbackProgress { reporter: Arc::clone(&self.reporter), job: job.clone() };
        let owned = job.clone();
        let limit = self.execution_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::timeout(limit, engine.execute(&owned, &progress)).await
        });
        match handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PurchaseOutcome::failed(
                format!("purchase execution exceeded {}s", limit.as_secs()),
                vec![],
            ),
            Err(e) => {
                error!(attempt = %job.attempt_id, "[WORKER] Purchase task aborted: {e}");
                PurchaseOutcome::failed("unexpected error during purchase execution", vec![])
            }
        }
    }

    async fn deliver(&self, claimed: &ClaimedJob, job: &PurchaseJob, outcome: PurchaseOutcome) {
        let report = CallbackReport::new(job, outcome, true);
        let mut last_err = None;
        for attempt in 0..CALLBACK_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(self.callback_backoff * 2u32.pow(attempt - 1)).await;
            }
            match self.reporter.send(&report).await {
                Ok(()) => {
                    self.settle_ack(&claimed.id).await;
                    return;
                }
                Err(e) => {
                    warn!(attempt = %job.attempt_id, try_no = attempt + 1, "[CALLBACK] Delivery failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        match self.queue.nack(&claimed.id, &format!("callback unreachable: {reason}")).await {
            Ok(NackOutcome::DeadLettered) => self.record_directly(job, &report.outcome).await,
            Ok(NackOutcome::Retrying { .. }) => {}
            Err(e) => warn!(job = %claimed.id, "[WORKER] Nack failed: {e}"),
        }
    }

    /// Last resort once the job is dead: write the result straight to the
    /// attempt row so a placed order is never lost. The purchase lock is left
    /// to expire on its own.
    async fn record_directly(&self, job: &PurchaseJob, outcome: &PurchaseOutcome) {
        error!(
            attempt = %job.attempt_id,
            status = %outcome.status,
            order = outcome.order_ref.as_deref().unwrap_or("-"),
            "[CALLBACK] Retries exhausted, recording outcome directly",
        );
        if let Err(e) = attempts::apply(&self.pool, &job.attempt_id, outcome, true, now_secs()).await {
            error!(attempt = %job.attempt_id, "[CALLBACK] Direct record failed: {e}");
        }
    }

    async fn settle_ack(&self, id: &str) {
        if let Err(e) = self.queue.ack(id).await {
            warn!(job = %id, "[WORKER] Ack failed: {e}");
        }
    }

    async fn settle_nack(&self, id: &str, reason: &str) {
        if let Err(e) = self.queue.nack(id, reason).await {
            warn!(job = %id, "[WORKER] Nack failed: {e}");
        }
    }

    async fn settle_dead(&self, id: &str, reason: &str) {
        if let Err(e) = self.queue.dead_letter(id, reason).await {
            warn!(job = %id, "[WORKER] Dead-letter failed: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingReporter {
        pub reports: Mutex<Vec<CallbackReport>>,
        pub down: AtomicBool,
    }

    impl RecordingReporter {
        pub fn terminal(&self) -> Vec<CallbackReport> {
            self.reports.lock().unwrap().iter().filter(|r| r.terminal).cloned().collect()
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl OutcomeReporter for RecordingReporter {
        async fn send(&self, report: &CallbackReport) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AppError::Callback("connection refused".to_string()));
            }
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingReporter;
    use super::*;
    use crate::automation::agent::testing::ScriptedModel;
    use crate::automation::browser::testing::{ClickEffect, ScriptedBrowser, ScriptedLauncher};
    use crate::credentials::testing::StaticVault;
    use crate::db::test_pool;
    use crate::dispatch::queue::SqliteQueue;
    use crate::playbook::PlaybookStore;

    struct Rig {
        pool: SqlitePool,
        queue: Arc<SqliteQueue>,
        reporter: Arc<RecordingReporter>,
        browser: ScriptedBrowser,
        worker: Worker,
    }

    async fn rig(replies: Vec<&str>) -> Rig {
        let pool = test_pool().await;
        let queue = Arc::new(SqliteQueue::new(pool.clone(), 3).with_timings(900, 0));
        let reporter = Arc::new(RecordingReporter::default());
        let browser = ScriptedBrowser::new("about:blank", "Widget");
        browser.on_click(
            "#buy",
            ClickEffect { text: Some("Thank you for your order. Order number: 44556677".into()), ..Default::default() },
        );
        let engine = Engine::new(
            Arc::new(ScriptedLauncher(browser.clone())),
            Arc::new(ScriptedModel::new(replies)),
            Arc::new(StaticVault::with("t1", "generic", None)),
            PlaybookStore::new(pool.clone()),
        )
        .with_pause((0, 0));
        let mut worker = Worker::new(
            queue.clone(),
            Arc::new(engine),
            reporter.clone(),
            pool.clone(),
            2,
            Duration::from_millis(10),
        );
        worker.callback_backoff = Duration::from_millis(1);
        Rig { pool, queue, reporter, browser, worker }
    }

    async fn enqueue(rig: &Rig) -> String {
        let attempt = attempts::create(&rig.pool, "t1", "w1", now_secs()).await.unwrap();
        let job = Job::Purchase(PurchaseJob {
            attempt_id: attempt.id.clone(),
            watch_item_id: "w1".into(),
            tenant_id: "t1".into(),
            retailer: "generic".into(),
            product_locator: "https://shop.example/p/1".into(),
            quantity: 1,
            price_ceiling: None,
        });
        rig.queue.enqueue(&job, "purchase:w1:1").await.unwrap();
        attempt.id
    }

    const BUY: &str = r##"{"action":"click","selector":"#buy","reason":"buy"}"##;

    #[tokio::test]
    async fn executes_reports_and_acks() {
        let rig = rig(vec![BUY]).await;
        let attempt_id = enqueue(&rig).await;

        let claimed = rig.queue.claim().await.unwrap().unwrap();
        rig.worker.handle(claimed.clone()).await;

        let terminal = rig.reporter.terminal();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].attempt_id, attempt_id);
        assert_eq!(terminal[0].outcome.status, PurchaseStatus::Success);
        assert_eq!(rig.queue.status_of(&claimed.id).await.unwrap().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn attempt_past_detected_is_acked_without_executing() {
        let rig = rig(vec![BUY]).await;
        let attempt_id = enqueue(&rig).await;
        attempts::apply(&rig.pool, &attempt_id, &PurchaseOutcome::failed("cancelled upstream", vec![]), true, now_secs())
            .await
            .unwrap();

        let claimed = rig.queue.claim().await.unwrap().unwrap();
        rig.worker.handle(claimed.clone()).await;

        assert!(rig.reporter.terminal().is_empty());
        assert!(rig.browser.log().is_empty());
        assert_eq!(rig.queue.status_of(&claimed.id).await.unwrap().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn unreachable_callback_redelivers_stored_outcome_without_rebuying() {
        let rig = rig(vec![BUY]).await;
        enqueue(&rig).await;

        rig.reporter.set_down(true);
        let claimed = rig.queue.claim().await.unwrap().unwrap();
        rig.worker.handle(claimed.clone()).await;
        assert_eq!(rig.queue.status_of(&claimed.id).await.unwrap().as_deref(), Some("pending"));
        let clicks_after_first = rig.browser.log().len();

        rig.reporter.set_down(false);
        let again = rig.queue.claim().await.unwrap().unwrap();
        rig.worker.handle(again).await;

        assert_eq!(rig.browser.log().len(), clicks_after_first);
        let terminal = rig.reporter.terminal();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].outcome.order_ref.as_deref(), Some("44556677"));
    }

    #[tokio::test]
    async fn dead_lettered_callback_still_records_the_order() {
        let rig = rig(vec![BUY]).await;
        let attempt_id = enqueue(&rig).await;

        rig.reporter.set_down(true);
        let mut job_id = String::new();
        for _ in 0..3 {
            let claimed = rig.queue.claim().await.unwrap().unwrap();
            job_id = claimed.id.clone();
            rig.worker.handle(claimed).await;
        }
        assert_eq!(rig.queue.status_of(&job_id).await.unwrap().as_deref(), Some("dead"));
        assert!(rig.reporter.terminal().is_empty());

        let stored = attempts::get(&rig.pool, &attempt_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Success);
        assert_eq!(stored.order_ref.as_deref(), Some("44556677"));
    }

    #[tokio::test]
    async fn unknown_job_kind_is_dead_lettered() {
        let rig = rig(vec![]).await;
        sqlx::query(
            "INSERT INTO jobs (id, kind, body, dedup_key, max_attempts, visible_at, created_at) VALUES ('j1', 'refund', '{\"kind\":\"refund\"}', 'r1', 3, 0, 0)",
        )
        .execute(&rig.pool)
        .await
        .unwrap();

        let claimed = rig.queue.claim().await.unwrap().unwrap();
        rig.worker.handle(claimed).await;
        assert_eq!(rig.queue.status_of("j1").await.unwrap().as_deref(), Some("dead"));
    }
}
