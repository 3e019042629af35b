//! Purchase execution against a live browser session: replay the active
//! playbook first, fall back to the vision agent, and record a fresh
//! playbook when the agent succeeds.

pub mod agent;
pub mod browser;
pub mod page;
pub mod vision;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::{AGENT_MAX_STEPS, REPLAY_PAUSE_MS};
use crate::credentials::CredentialVault;
use crate::dispatch::PurchaseJob;
use crate::playbook::{replay, Action, Playbook, PlaybookStore, TemplateVars};
use crate::retailers::{adapter_by_key, adapter_for, RetailerAdapter};
use crate::types::{now_secs, PurchaseOutcome, PurchaseStatus};

use agent::{run_agent, AgentTask};
use browser::{BrowserLauncher, BrowserSession};
use page::{classify, extract_total, PageState};
use vision::VisionModel;

/// Receives non-terminal progress while a purchase runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, status: PurchaseStatus, note: &str);
}

pub struct Engine {
    launcher: Arc<dyn BrowserLauncher>,
    vision: Arc<dyn VisionModel>,
    vault: Arc<dyn CredentialVault>,
    playbooks: PlaybookStore,
    pause_ms: (u64, u64),
    max_steps: usize,
}

/// How a replay attempt ended, from the engine's point of view.
enum ReplayVerdict {
    /// Final outcome; do not run the agent.
    Final(PurchaseOutcome),
    /// Replay aborted before committing; the agent takes over.
    FallBack,
}

impl Engine {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        vision: Arc<dyn VisionModel>,
        vault: Arc<dyn CredentialVault>,
        playbooks: PlaybookStore,
    ) -> Self {
        Self {
            launcher,
            vision,
            vault,
            playbooks,
            pause_ms: REPLAY_PAUSE_MS,
            max_steps: AGENT_MAX_STEPS,
        }
    }

    pub fn with_pause(mut self, pause_ms: (u64, u64)) -> Self {
        self.pause_ms = pause_ms;
        self
    }

    pub async fn execute(&self, job: &PurchaseJob, progress: &dyn ProgressSink) -> PurchaseOutcome {
        let Some(adapter) = adapter_by_key(&job.retailer).or_else(|| adapter_for(&job.product_locator)) else {
            return PurchaseOutcome::failed(format!("no adapter for retailer {}", job.retailer), vec![]);
        };

        let creds = match self.vault.fetch(&job.tenant_id, adapter.key()).await {
            Ok(Some(c)) => c,
            Ok(None) => return PurchaseOutcome::failed("no stored credentials for this retailer", vec![]),
            Err(e) => return PurchaseOutcome::failed(format!("credential vault unavailable: {e}"), vec![]),
        };
        let mut vars = TemplateVars::new();
        vars.set("product_url", job.product_locator.as_str())
            .set("username", creds.username.expose())
            .set("password", creds.password.expose())
            .set("quantity", job.quantity.to_string());
        if let Some(cvv) = &creds.cvv {
            vars.set("cvv", cvv.expose());
        }

        let profile = format!("{}-{}", job.tenant_id, adapter.key());
        let session = match self.launcher.launch(&profile).await {
            Ok(s) => s,
            Err(e) => return PurchaseOutcome::failed(format!("browser unavailable: {e}"), vec![]),
        };

        let outcome = self
            .run(session.as_ref(), adapter, job, &vars, creds.cvv.is_some(), progress)
            .await;

        if let Err(e) = session.close().await {
            warn!(attempt = %job.attempt_id, "[ENGINE] Session close failed: {e}");
        }
        outcome
    }

    async fn run(
        &self,
        session: &dyn BrowserSession,
        adapter: &'static dyn RetailerAdapter,
        job: &PurchaseJob,
        vars: &TemplateVars,
        has_cvv: bool,
        progress: &dyn ProgressSink,
    ) -> PurchaseOutcome {
        let playbook = match self.playbooks.active_for(adapter.key()).await {
            Ok(p) => p,
            Err(e) => {
                warn!(retailer = adapter.key(), "[ENGINE] Playbook lookup failed, using agent: {e}");
                None
            }
        };

        if let Some(pb) = playbook {
            match self.replay_playbook(session, adapter, &pb, job, vars, progress).await {
                ReplayVerdict::Final(outcome) => return outcome,
                ReplayVerdict::FallBack => {
                    info!(attempt = %job.attempt_id, "[ENGINE] Replay failed, falling back to agent");
                }
            }
        }

        let task = AgentTask {
            adapter,
            product_url: &job.product_locator,
            quantity: job.quantity,
            price_ceiling: job.price_ceiling,
            vars,
            has_cvv,
            max_steps: self.max_steps,
        };
        let outcome = run_agent(session, self.vision.as_ref(), &task, progress).await;

        if outcome.status == PurchaseStatus::Success {
            let steps = adapter.checkout_steps();
            if let Err(e) = self.playbooks.save(adapter.key(), &steps, now_secs()).await {
                error!(retailer = adapter.key(), "[ENGINE] Failed to record playbook: {e}");
            }
        }
        outcome
    }

    /// Replay in two segments split at the commit action (the last required
    /// click), checking the cart total against the ceiling in between, then
    /// confirm the order from page state.
    async fn replay_playbook(
        &self,
        session: &dyn BrowserSession,
        adapter: &dyn RetailerAdapter,
        pb: &Playbook,
        job: &PurchaseJob,
        vars: &TemplateVars,
        progress: &dyn ProgressSink,
    ) -> ReplayVerdict {
        let commit = commit_index(&pb.steps);
        let (before, after) = pb.steps.split_at(commit);
        info!(retailer = %pb.retailer, version = pb.version, steps = pb.steps.len(), "[ENGINE] Replaying playbook");

        let first = replay(session, before, vars, self.pause_ms).await;
        if !first.success {
            self.count_failure(pb).await;
            return ReplayVerdict::FallBack;
        }
        let mut completed = first.steps_completed;

        progress.report(PurchaseStatus::Carted, "replay finished the pre-commit steps").await;
        progress.report(PurchaseStatus::CheckoutPayment, "replay reached the commit step").await;
        let text = session.page_text().await.unwrap_or_default();
        if let (Some(ceiling), Some(total)) = (job.price_ceiling, extract_total(&text)) {
            let limit = ceiling * job.quantity.max(1) as f64;
            if total > limit {
                return ReplayVerdict::Final(PurchaseOutcome::failed(
                    format!("checkout total {total:.2} exceeds price ceiling {limit:.2}; item left in cart"),
                    completed,
                ));
            }
        }

        let second = replay(session, after, vars, self.pause_ms).await;
        completed.extend(second.steps_completed);
        if !second.success {
            // The commit click may have gone through; running the agent now
            // risks a second order.
            self.count_failure(pb).await;
            let reason = second.error.unwrap_or_else(|| "replay failed after commit".to_string());
            return ReplayVerdict::Final(PurchaseOutcome::carted_unconfirmed(
                format!("{reason}; order state unknown"),
                completed,
            ));
        }

        let url = session.current_url().await.unwrap_or_default();
        let text = session.page_text().await.unwrap_or_default();
        let outcome = match classify(&url, &text, adapter.confirmation_markers()) {
            PageState::Confirmed { order_ref, total } => {
                if let Err(e) = self.playbooks.record_success(&pb.id).await {
                    warn!(playbook = %pb.id, "[ENGINE] Failed to count success: {e}");
                }
                return ReplayVerdict::Final(PurchaseOutcome::success(order_ref, total, completed));
            }
            PageState::LoginRequired => PurchaseOutcome::failed("login failed or session expired", completed),
            PageState::MfaRequired => {
                PurchaseOutcome::failed("MFA or verification prompt requires manual action", completed)
            }
            PageState::CvvRequired => PurchaseOutcome::failed("verification code required", completed),
            PageState::ErrorText(msg) => {
                PurchaseOutcome::failed(format!("retailer reported an error: {msg}"), completed)
            }
            PageState::Other => PurchaseOutcome::carted_unconfirmed(
                "playbook completed but no order confirmation was detected",
                completed,
            ),
        };
        self.count_failure(pb).await;
        ReplayVerdict::Final(outcome)
    }

    async fn count_failure(&self, pb: &Playbook) {
        if let Err(e) = self.playbooks.record_failure(&pb.id).await {
            warn!(playbook = %pb.id, "[ENGINE] Failed to count replay failure: {e}");
        }
    }
}

/// Index of the last required click; everything before it is safe to abandon.
fn commit_index(steps: &[Action]) -> usize {
    steps
        .iter()
        .rposition(|s| matches!(s, Action::Click { optional: false, .. }))
        .unwrap_or(steps.len())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingProgress(pub Mutex<Vec<PurchaseStatus>>);

    impl RecordingProgress {
        pub fn statuses(&self) -> Vec<PurchaseStatus> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProgressSink for RecordingProgress {
        async fn report(&self, status: PurchaseStatus, _note: &str) {
            self.0.lock().unwrap().push(status);
        }
    }
}
