//! Periodic driver: picks due watch items, resolves them fairly across
//! tenants within a wall-clock budget, and dispatches eligible purchases.

pub mod select;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::config::{Config, ITEM_LOCK_TTL_SECS, PURCHASE_LOCK_TTL_SECS};
use crate::credentials::CredentialVault;
use crate::db::activity::ActivityLog;
use crate::db::{attempts, watch_items};
use crate::dispatch::{purchase_dedup_key, Job, JobQueue, PurchaseJob};
use crate::error::Result;
use crate::locks::LockManager;
use crate::resolver::Resolver;
use crate::types::{now_secs, ActivityKind, PurchaseOutcome, StockSnapshot, StockStatus, WatchItem, WatchMode};

use select::{fair_interleave, is_due};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub selected: usize,
    pub resolved: usize,
    /// Items answered from a snapshot already resolved this cycle.
    pub deduped: usize,
    pub failed: usize,
    pub skipped_locked: usize,
    pub purchases_triggered: usize,
    /// Items left unprocessed when the budget ran out; still due next cycle.
    pub timed_out: usize,
}

/// One cycle's resolutions keyed by product locator. Failures are cached too,
/// so a dead locator is not retried for every tenant watching it.
#[derive(Default)]
pub struct SnapshotCache {
    entries: HashMap<String, std::result::Result<Arc<StockSnapshot>, String>>,
}

impl SnapshotCache {
    pub fn get(&self, locator: &str) -> Option<std::result::Result<Arc<StockSnapshot>, String>> {
        self.entries.get(locator).cloned()
    }

    pub fn insert(&mut self, locator: &str, result: std::result::Result<Arc<StockSnapshot>, String>) {
        self.entries.insert(locator.to_string(), result);
    }
}

/// Why an in-stock auto-purchase item was not dispatched.
#[derive(Debug, PartialEq)]
enum Trigger {
    Dispatched,
    Blocked(String),
    /// Something else already owns this purchase; not worth an activity row.
    Skipped,
}

pub struct Scheduler {
    cfg: Config,
    pool: SqlitePool,
    resolver: Resolver,
    locks: LockManager,
    vault: Arc<dyn CredentialVault>,
    queue: Arc<dyn JobQueue>,
    activity: ActivityLog,
    health: Arc<HealthState>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        pool: SqlitePool,
        resolver: Resolver,
        locks: LockManager,
        vault: Arc<dyn CredentialVault>,
        queue: Arc<dyn JobQueue>,
        activity: ActivityLog,
        health: Arc<HealthState>,
    ) -> Self {
        Self { cfg, pool, resolver, locks, vault, queue, activity, health }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.cfg.cycle_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(Some(_)) => {}
                Ok(None) => info!("[CYCLE] Another cycle holds the lock, skipping"),
                Err(e) => error!("[CYCLE] Cycle failed: {e}"),
            }
        }
    }

    /// Run one cycle. `Ok(None)` when another run holds the cycle lock.
    pub async fn run_cycle(&self) -> Result<Option<CycleReport>> {
        let key = LockManager::cycle_key();
        let ttl = Duration::from_secs(self.cfg.cycle_lock_ttl_secs());
        if !self.locks.acquire(&key, ttl).await {
            self.health.inc_cycles_skipped();
            return Ok(None);
        }

        let result = self.cycle_body().await;
        self.locks.release(&key).await;

        let report = result?;
        self.health.record_cycle(now_secs(), &report);
        info!(
            selected = report.selected,
            resolved = report.resolved,
            deduped = report.deduped,
            failed = report.failed,
            skipped_locked = report.skipped_locked,
            purchases = report.purchases_triggered,
            timed_out = report.timed_out,
            "[CYCLE] Complete",
        );
        Ok(Some(report))
    }

    async fn cycle_body(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.cfg.cycle_budget_secs);
        let now = now_secs();

        let due: Vec<WatchItem> = watch_items::list_active(&self.pool)
            .await?
            .into_iter()
            .filter(|item| is_due(item, now, self.cfg.min_poll_interval_secs))
            .collect();
        let batch = fair_interleave(due, self.cfg.max_items_per_tenant, self.cfg.max_items_per_cycle);

        let mut report = CycleReport { selected: batch.len(), ..Default::default() };
        let mut cache = SnapshotCache::default();
        let delay = Duration::from_millis(self.cfg.inter_item_delay_ms);

        for (idx, item) in batch.iter().enumerate() {
            if Instant::now() >= deadline {
                report.timed_out += batch.len() - idx;
                warn!(remaining = batch.len() - idx, "[CYCLE] Budget exhausted");
                break;
            }
            if idx > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let key = LockManager::item_key(&item.id);
            if !self.locks.acquire(&key, Duration::from_secs(ITEM_LOCK_TTL_SECS)).await {
                debug!(item = %item.id, "[CYCLE] Item locked elsewhere");
                report.skipped_locked += 1;
                continue;
            }
            self.process_item(item, &mut cache, &mut report, deadline).await;
            self.locks.release(&key).await;
        }

        Ok(report)
    }

    async fn process_item(
        &self,
        item: &WatchItem,
        cache: &mut SnapshotCache,
        report: &mut CycleReport,
        deadline: Instant,
    ) {
        let resolved = match cache.get(&item.product_locator) {
            Some(hit) => {
                report.deduped += 1;
                hit
            }
            None => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let fresh = match tokio::time::timeout(remaining, self.resolver.resolve(&item.product_locator)).await {
                    Ok(Ok(snapshot)) => Ok(Arc::new(snapshot)),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => {
                        // Nothing was persisted; the item stays due.
                        report.timed_out += 1;
                        return;
                    }
                };
                cache.insert(&item.product_locator, fresh.clone());
                fresh
            }
        };

        let now = now_secs();
        let snapshot = match resolved {
            Ok(s) => s,
            Err(reason) => {
                report.failed += 1;
                error!(item = %item.id, locator = %item.product_locator, "[CYCLE] {reason}");
                if let Err(e) = watch_items::touch_checked(&self.pool, &item.id, now).await {
                    warn!(item = %item.id, "[CYCLE] Could not mark item checked: {e}");
                }
                self.activity.record(&item.id, &item.tenant_id, ActivityKind::ResolutionFailed, reason);
                return;
            }
        };

        if let Err(e) = watch_items::record_snapshot(&self.pool, &item.id, &snapshot, now).await {
            report.failed += 1;
            error!(item = %item.id, "[CYCLE] Snapshot write failed: {e}");
            return;
        }
        report.resolved += 1;

        if snapshot.in_stock && item.last_status == StockStatus::OutOfStock {
            let price = snapshot.price.map(|p| format!(" at ${p:.2}")).unwrap_or_default();
            info!(item = %item.id, raw_status = %snapshot.raw_status, "[CYCLE] Restock detected");
            self.activity.record(
                &item.id,
                &item.tenant_id,
                ActivityKind::RestockDetected,
                format!("{} back in stock{price}", snapshot.display_name),
            );
        }

        match self.maybe_trigger(item, &snapshot).await {
            Ok(Trigger::Dispatched) => report.purchases_triggered += 1,
            Ok(Trigger::Blocked(reason)) => {
                info!(item = %item.id, "[CYCLE] Purchase blocked: {reason}");
                self.activity.record(&item.id, &item.tenant_id, ActivityKind::PurchaseBlocked, reason);
            }
            Ok(Trigger::Skipped) => {}
            Err(e) => error!(item = %item.id, "[CYCLE] Purchase trigger failed: {e}"),
        }
    }

    async fn maybe_trigger(&self, item: &WatchItem, snapshot: &StockSnapshot) -> Result<Trigger> {
        if !snapshot.in_stock || item.mode != WatchMode::AutoPurchase {
            return Ok(Trigger::Skipped);
        }
        if let (Some(ceiling), Some(price)) = (item.price_ceiling, snapshot.price) {
            if price > ceiling {
                return Ok(Trigger::Blocked(format!(
                    "price ${price:.2} exceeds ceiling ${ceiling:.2}"
                )));
            }
        }

        let now = now_secs();
        let lock_ttl = Duration::from_secs(PURCHASE_LOCK_TTL_SECS);
        if attempts::has_open_attempt(&self.pool, &item.id, now - PURCHASE_LOCK_TTL_SECS as i64).await? {
            debug!(item = %item.id, "[CYCLE] Purchase already in flight");
            return Ok(Trigger::Skipped);
        }
        if !self.vault.has_credentials(&item.tenant_id, &item.retailer).await? {
            return Ok(Trigger::Blocked(format!("no stored credentials for {}", item.retailer)));
        }

        let purchase_key = LockManager::purchase_key(&item.id);
        if !self.locks.acquire(&purchase_key, lock_ttl).await {
            return Ok(Trigger::Skipped);
        }
        if !self
            .locks
            .try_take_session(&item.tenant_id, self.cfg.max_concurrent_purchases, lock_ttl)
            .await
        {
            self.locks.release(&purchase_key).await;
            return Ok(Trigger::Blocked("concurrent purchase quota reached".to_string()));
        }

        let attempt = match attempts::create(&self.pool, &item.tenant_id, &item.id, now).await {
            Ok(a) => a,
            Err(e) => {
                self.locks.release(&purchase_key).await;
                return Err(e);
            }
        };
        let job = Job::Purchase(PurchaseJob {
            attempt_id: attempt.id.clone(),
            watch_item_id: item.id.clone(),
            tenant_id: item.tenant_id.clone(),
            retailer: item.retailer.clone(),
            product_locator: item.product_locator.clone(),
            quantity: item.quantity,
            price_ceiling: item.price_ceiling,
        });
        let dedup_key = purchase_dedup_key(&item.id, now, self.cfg.dedup_window_secs);

        match self.queue.enqueue(&job, &dedup_key).await {
            Ok(receipt) if receipt.deduplicated => {
                let reason = format!("duplicate of dispatched job {}", receipt.message_id);
                self.close_attempt(&attempt.id, PurchaseOutcome::cancelled(reason)).await;
                self.locks.release(&purchase_key).await;
                Ok(Trigger::Skipped)
            }
            Ok(receipt) => {
                info!(
                    item = %item.id,
                    attempt = %attempt.id,
                    message_id = %receipt.message_id,
                    "[CYCLE] Purchase dispatched",
                );
                self.activity.record(
                    &item.id,
                    &item.tenant_id,
                    ActivityKind::PurchaseTriggered,
                    format!("purchase attempt {} dispatched", attempt.id),
                );
                Ok(Trigger::Dispatched)
            }
            Err(e) => {
                self.close_attempt(&attempt.id, PurchaseOutcome::failed(format!("dispatch failed: {e}"), vec![]))
                    .await;
                self.locks.release(&purchase_key).await;
                Err(e)
            }
        }
    }

    async fn close_attempt(&self, attempt_id: &str, outcome: PurchaseOutcome) {
        if let Err(e) = attempts::apply(&self.pool, attempt_id, &outcome, true, now_secs()).await {
            warn!(attempt = %attempt_id, "[CYCLE] Could not close attempt: {e}");
        }
    }
}
