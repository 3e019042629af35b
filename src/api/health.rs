//! Shared health state for the /health endpoint.
//! Updated by the scheduler after every cycle, read by the API.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::scheduler::CycleReport;

#[derive(Default)]
pub struct HealthState {
    /// Unix seconds of the last completed cycle (0 = none yet).
    pub last_cycle_at: AtomicU64,
    pub cycles_run: AtomicU64,
    /// Cycles abandoned because another run held the cycle lock.
    pub cycles_skipped: AtomicU64,
    pub last_selected: AtomicU64,
    pub last_resolved: AtomicU64,
    pub last_failed: AtomicU64,
    pub last_timed_out: AtomicU64,
    pub purchases_triggered: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub last_cycle_at: u64,
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub last_selected: u64,
    pub last_resolved: u64,
    pub last_failed: u64,
    pub last_timed_out: u64,
    pub purchases_triggered: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, at: i64, report: &CycleReport) {
        self.last_cycle_at.store(at.max(0) as u64, Ordering::Relaxed);
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.last_selected.store(report.selected as u64, Ordering::Relaxed);
        self.last_resolved.store(report.resolved as u64, Ordering::Relaxed);
        self.last_failed.store(report.failed as u64, Ordering::Relaxed);
        self.last_timed_out.store(report.timed_out as u64, Ordering::Relaxed);
        self.purchases_triggered
            .fetch_add(report.purchases_triggered as u64, Ordering::Relaxed);
    }

    pub fn inc_cycles_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            last_cycle_at: self.last_cycle_at.load(Ordering::Relaxed),
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            last_selected: self.last_selected.load(Ordering::Relaxed),
            last_resolved: self.last_resolved.load(Ordering::Relaxed),
            last_failed: self.last_failed.load(Ordering::Relaxed),
            last_timed_out: self.last_timed_out.load(Ordering::Relaxed),
            purchases_triggered: self.purchases_triggered.load(Ordering::Relaxed),
        }
    }
}
