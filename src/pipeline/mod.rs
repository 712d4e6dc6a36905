// ============================================================================
// Pipeline Orchestrator
// ============================================================================
//
// Runs an intent through INPUT -> NORMALIZE -> AI_JUDGE -> FEEDBACK -> OUTPUT.
//
// `execute` is pure with respect to the store. `execute_with_lock` holds the
// per-id row lock for the whole run, so two runs on one id never interleave,
// and commits the result with a single version bump. Deadlocks on the lock
// retry the whole call; lock timeouts surface immediately.
//
// ============================================================================

pub mod stages;

pub use stages::{
    AcceptingFeedback, AiJudge, AiJudgeStage, CorrectionPlan, FeedbackBridge, FeedbackJudgment,
    FeedbackStage, InputStage, NormalizeStage, OutputStage, PipelineStage, RuleBasedJudge,
    standard_stages,
};

use crate::audit::{AuditEntry, AuditSink, STATUS_BRIDGE, emit};
use crate::config::{ConcurrencyConfig, ExecutionMode};
use crate::core::{
    AuditEvent, BridgeError, Intent, IntentId, IntentStatus, Result, Severity,
};
use crate::retry::{RetryPolicy, with_deadlock_retry};
use crate::storage::IntentStore;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub struct PipelineOrchestrator {
    store: Arc<dyn IntentStore>,
    audit: Arc<dyn AuditSink>,
    stages: Vec<Arc<dyn PipelineStage>>,
    config: ConcurrencyConfig,
    retry: RetryPolicy,
}

impl PipelineOrchestrator {
    /// Orchestrator over the standard five stages.
    pub fn new(
        store: Arc<dyn IntentStore>,
        audit: Arc<dyn AuditSink>,
        judge: Arc<dyn AiJudge>,
        feedback: Arc<dyn FeedbackBridge>,
        config: ConcurrencyConfig,
    ) -> Self {
        let stages = standard_stages(judge, feedback, &config);
        Self::with_stages(store, audit, stages, config)
    }

    /// Orchestrator over a caller-supplied stage list, run in the given order.
    pub fn with_stages(
        store: Arc<dyn IntentStore>,
        audit: Arc<dyn AuditSink>,
        stages: Vec<Arc<dyn PipelineStage>>,
        config: ConcurrencyConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        Self {
            store,
            audit,
            stages,
            config,
            retry,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persists a new intent and audits its reception.
    pub async fn create(&self, intent: Intent) -> Result<Intent> {
        let saved = self.store.save(intent).await?;
        emit(
            self.audit.as_ref(),
            AuditEntry::new("pipeline", "create", AuditEvent::IntentReceived, Severity::Info)
                .intent(&saved)
                .detail("intent_type", saved.intent_type.clone()),
        )
        .await;
        Ok(saved)
    }

    /// Runs every stage on `intent` without touching the store.
    pub async fn execute(&self, intent: Intent) -> Result<Intent> {
        let span = info_span!("pipeline.execute", intent_id = %intent.id);
        self.run_stages(intent).instrument(span).await
    }

    async fn run_stages(&self, mut intent: Intent) -> Result<Intent> {
        for stage in &self.stages {
            let name = stage.stage();
            emit(
                self.audit.as_ref(),
                AuditEntry::for_stage(name, AuditEvent::BridgeStarted, Severity::Info).intent(&intent),
            )
            .await;

            match stage.run(intent.clone()).await {
                Ok(next) => {
                    intent = next;
                    emit(
                        self.audit.as_ref(),
                        AuditEntry::for_stage(name, AuditEvent::BridgeCompleted, Severity::Info)
                            .intent(&intent)
                            .detail("status", intent.status.as_str()),
                    )
                    .await;
                }
                Err(err) => {
                    event!(Level::ERROR, intent_id = %intent.id, stage = %name, error = %err, "stage failed");
                    emit(
                        self.audit.as_ref(),
                        AuditEntry::for_stage(name, AuditEvent::BridgeFailed, Severity::Error)
                            .intent(&intent)
                            .detail("error", err.to_string()),
                    )
                    .await;
                    match self.config.execution_mode {
                        ExecutionMode::FailFast => {
                            self.report_finish(&intent, AuditEvent::IntentFailed).await;
                            return Err(err);
                        }
                        ExecutionMode::Continue => intent.advance_status(IntentStatus::Failed),
                    }
                }
            }
        }

        let finished = if intent.status == IntentStatus::Failed {
            AuditEvent::IntentFailed
        } else {
            AuditEvent::IntentCompleted
        };
        self.report_finish(&intent, finished).await;
        Ok(intent)
    }

    /// Runs the pipeline under the row lock of `id` and commits the result.
    ///
    /// `initial` is stored first when `id` does not exist yet; an existing row
    /// always wins over it. When the run then fails, the stored seed is
    /// removed again unless another writer has already moved it on.
    pub async fn execute_with_lock(&self, id: &IntentId, initial: Option<Intent>) -> Result<Intent> {
        let span = info_span!("pipeline.execute_with_lock", intent_id = %id);
        self.seeded_run(id, initial).instrument(span).await
    }

    async fn seeded_run(&self, id: &IntentId, initial: Option<Intent>) -> Result<Intent> {
        let seeded = match initial {
            Some(seed) => self.store_seed(id, seed).await?,
            None => None,
        };

        let result = with_deadlock_retry(&self.retry, move || self.locked_run(id)).await;
        if let (Err(err), Some(version)) = (&result, seeded) {
            self.discard_seed(id, version, err).await;
        }
        result
    }

    /// Saves `seed` under `id`. Returns the stored version, or `None` when a
    /// row already existed.
    async fn store_seed(&self, id: &IntentId, seed: Intent) -> Result<Option<u64>> {
        match self.store.save(seed.with_id(*id)).await {
            Ok(saved) => {
                event!(Level::DEBUG, intent_id = %saved.id, "stored initial intent");
                Ok(Some(saved.version))
            }
            Err(BridgeError::AlreadyExists(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn discard_seed(&self, id: &IntentId, version: u64, cause: &BridgeError) {
        match self.store.delete(id, version).await {
            Ok(true) => event!(
                Level::DEBUG,
                intent_id = %id,
                error = %cause,
                "discarded initial intent after failed run"
            ),
            Ok(false) => event!(
                Level::DEBUG,
                intent_id = %id,
                "initial intent kept, another writer committed to it"
            ),
            Err(err) => event!(
                Level::WARN,
                intent_id = %id,
                error = %err,
                "failed to discard initial intent"
            ),
        }
    }

    async fn locked_run(&self, id: &IntentId) -> Result<Intent> {
        let mut session = self
            .store
            .lock_for_update(id, self.config.lock_timeout())
            .await?;
        let result = self.run_stages(session.intent().clone()).await?;
        session.replace(result);
        let committed = session.commit().await?;
        event!(
            Level::INFO,
            intent_id = %committed.id,
            version = committed.version,
            status = %committed.status,
            "locked pipeline run committed"
        );
        Ok(committed)
    }

    /// Strict status change under the row lock, retried on deadlock.
    pub async fn update_status(&self, id: &IntentId, status: IntentStatus) -> Result<Intent> {
        let store = &self.store;
        let updated = with_deadlock_retry(&self.retry, move || store.update_status(id, status)).await?;
        emit(
            self.audit.as_ref(),
            AuditEntry::new(STATUS_BRIDGE, "update_status", AuditEvent::StatusChanged, Severity::Info)
                .intent(&updated)
                .detail("status", status.as_str())
                .detail("version", updated.version),
        )
        .await;
        Ok(updated)
    }

    async fn report_finish(&self, intent: &Intent, finished: AuditEvent) {
        let severity = if finished == AuditEvent::IntentFailed {
            Severity::Error
        } else {
            Severity::Info
        };
        emit(
            self.audit.as_ref(),
            AuditEntry::new("pipeline", "execute", finished, severity)
                .intent(intent)
                .detail("status", intent.status.as_str()),
        )
        .await;
    }
}
