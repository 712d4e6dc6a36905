// ============================================================================
// Correction Service
// ============================================================================
//
// Applies re-evaluation requests to stored intents.
//
// Optimistic path: read, merge, compare-and-swap, up to `optimistic_attempts`
// times with a cooperative yield in between. When every attempt loses the
// race the request falls back to the row lock, wrapped in deadlock retry, and
// a WARNING starvation entry is audited once.
//
// A correction id already present in the history is never applied twice.
//
// ============================================================================

use crate::audit::{AuditEntry, AuditSink, CORRECTION_BRIDGE, emit};
use crate::config::{ConcurrencyConfig, LockStrategy};
use crate::core::{
    AuditEvent, BridgeError, Correction, CorrectionApplied, CorrectionId, CorrectionRecord,
    Intent, IntentId, IntentStatus, PhilosophicalActor, Result, Severity,
};
use crate::diff::Diff;
use crate::retry::{RetryPolicy, with_deadlock_retry};
use crate::storage::IntentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ReevaluationRequest {
    pub intent_id: IntentId,
    pub diff: Diff,
    pub source: PhilosophicalActor,
    pub reason: String,
    /// Derived from the intent id and the diff when absent.
    pub correction_id: Option<CorrectionId>,
}

impl ReevaluationRequest {
    pub fn new(intent_id: IntentId, diff: Diff, source: PhilosophicalActor) -> Self {
        Self {
            intent_id,
            diff,
            source,
            reason: String::new(),
            correction_id: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn correction_id(mut self, correction_id: CorrectionId) -> Self {
        self.correction_id = Some(correction_id);
        self
    }

    pub fn to_correction(&self) -> Result<Correction> {
        let correction_id = match self.correction_id {
            Some(id) => id,
            None => CorrectionId::derive(&self.intent_id, &self.diff)?,
        };
        Ok(Correction {
            correction_id,
            diff: self.diff.clone(),
            reason: self.reason.clone(),
            source: self.source,
        })
    }
}

/// Which path committed (or skipped) the correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStrategy {
    Optimistic,
    Pessimistic,
    /// The correction id was already recorded; nothing was written.
    Replay,
}

impl fmt::Display for ApplyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Optimistic => "optimistic",
            Self::Pessimistic => "pessimistic",
            Self::Replay => "idempotent_replay",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReevaluationOutcome {
    pub intent_id: IntentId,
    pub correlation_id: Uuid,
    pub already_applied: bool,
    pub correction_id: CorrectionId,
    pub status: IntentStatus,
    pub version: u64,
    pub correction_count: usize,
    pub applied_at: DateTime<Utc>,
    pub strategy: ApplyStrategy,
    /// Optimistic attempts spent before the outcome, 0 on the pessimistic-only path.
    pub attempts: u32,
}

/// Result of the CAS loop: either an outcome, or the last value seen before
/// every attempt lost.
enum OptimisticRun {
    Done(ReevaluationOutcome),
    Starved(Intent),
}

impl ReevaluationOutcome {
    fn from_intent(
        intent: &Intent,
        record: &CorrectionRecord,
        strategy: ApplyStrategy,
        attempts: u32,
    ) -> Self {
        Self {
            intent_id: intent.id,
            correlation_id: intent.correlation_id,
            already_applied: strategy == ApplyStrategy::Replay,
            correction_id: record.correction_id,
            status: intent.status,
            version: intent.version,
            correction_count: intent.correction_history.len(),
            applied_at: record.applied_at,
            strategy,
            attempts,
        }
    }
}

pub struct CorrectionService {
    store: Arc<dyn IntentStore>,
    audit: Arc<dyn AuditSink>,
    config: ConcurrencyConfig,
    retry: RetryPolicy,
}

impl CorrectionService {
    pub fn new(
        store: Arc<dyn IntentStore>,
        audit: Arc<dyn AuditSink>,
        config: ConcurrencyConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        Self {
            store,
            audit,
            config,
            retry,
        }
    }

    /// Overrides the deadlock retry policy derived from the config.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn reevaluate(&self, request: ReevaluationRequest) -> Result<ReevaluationOutcome> {
        let span = info_span!(
            "correction.reevaluate",
            intent_id = %request.intent_id,
            source = %request.source
        );
        self.reevaluate_inner(request).instrument(span).await
    }

    async fn reevaluate_inner(&self, request: ReevaluationRequest) -> Result<ReevaluationOutcome> {
        if !self.config.is_authorized(request.source) {
            return Err(BridgeError::UnauthorizedSource(request.source.to_string()));
        }
        request.diff.validate()?;
        let correction = request.to_correction()?;
        let id = request.intent_id;

        let outcome = match self.config.reevaluate_strategy {
            LockStrategy::Pessimistic => self.apply_locked(&id, &correction, 0).await?,
            LockStrategy::Optimistic => match self.apply_optimistic(&id, &correction).await? {
                OptimisticRun::Done(outcome) => outcome,
                OptimisticRun::Starved(last_seen) => {
                    let attempts = self.config.optimistic_attempts;
                    self.report_starvation(&last_seen, &correction, attempts).await;
                    self.apply_locked(&id, &correction, attempts).await?
                }
            },
        };

        self.report_outcome(&correction, &outcome).await;
        Ok(outcome)
    }

    async fn apply_optimistic(&self, id: &IntentId, correction: &Correction) -> Result<OptimisticRun> {
        let attempts = self.config.optimistic_attempts;
        let mut last_seen = None;
        for attempt in 1..=attempts {
            let current = self.store.get(id).await?;
            match current.apply_correction(correction)? {
                CorrectionApplied::AlreadyApplied { record } => {
                    return Ok(OptimisticRun::Done(ReevaluationOutcome::from_intent(
                        &current,
                        &record,
                        ApplyStrategy::Replay,
                        attempt,
                    )));
                }
                CorrectionApplied::Applied { mut intent, record } => {
                    let expected = current.version;
                    if self.store.compare_and_swap(id, intent.clone(), expected).await? {
                        intent.version = expected + 1;
                        return Ok(OptimisticRun::Done(ReevaluationOutcome::from_intent(
                            &intent,
                            &record,
                            ApplyStrategy::Optimistic,
                            attempt,
                        )));
                    }
                }
            }
            last_seen = Some(current);
            event!(
                Level::DEBUG,
                intent_id = %id,
                attempt,
                max_attempts = attempts,
                "optimistic update lost the race"
            );
            tokio::task::yield_now().await;
        }
        match last_seen {
            Some(intent) => Ok(OptimisticRun::Starved(intent)),
            None => self.store.get(id).await.map(OptimisticRun::Starved),
        }
    }

    async fn apply_locked(
        &self,
        id: &IntentId,
        correction: &Correction,
        optimistic_attempts: u32,
    ) -> Result<ReevaluationOutcome> {
        let store = &self.store;
        let timeout = self.config.lock_timeout();
        with_deadlock_retry(&self.retry, move || async move {
            let mut session = store.lock_for_update(id, timeout).await?;
            match session.intent().apply_correction(correction)? {
                CorrectionApplied::AlreadyApplied { record } => Ok(ReevaluationOutcome::from_intent(
                    session.original(),
                    &record,
                    ApplyStrategy::Replay,
                    optimistic_attempts,
                )),
                CorrectionApplied::Applied { intent, record } => {
                    session.replace(intent);
                    let committed = session.commit().await?;
                    Ok(ReevaluationOutcome::from_intent(
                        &committed,
                        &record,
                        ApplyStrategy::Pessimistic,
                        optimistic_attempts,
                    ))
                }
            }
        })
        .await
    }

    async fn report_starvation(&self, intent: &Intent, correction: &Correction, attempts: u32) {
        event!(
            Level::WARN,
            intent_id = %intent.id,
            correlation_id = %intent.correlation_id,
            correction_id = %correction.correction_id,
            attempts,
            "optimistic updates starved, falling back to row lock"
        );
        let entry = AuditEntry::new(
            CORRECTION_BRIDGE,
            "reevaluate",
            AuditEvent::StarvationFallback,
            Severity::Warning,
        )
        .intent(intent)
        .detail("starvation_detected", true)
        .detail("fallback_strategy", "pessimistic")
        .detail("optimistic_attempts", attempts)
        .detail("correction_id", correction.correction_id.to_string());
        emit(self.audit.as_ref(), entry).await;
    }

    async fn report_outcome(&self, correction: &Correction, outcome: &ReevaluationOutcome) {
        let severity = if outcome.already_applied {
            Severity::Debug
        } else {
            Severity::Info
        };
        event!(
            Level::INFO,
            intent_id = %outcome.intent_id,
            correction_id = %outcome.correction_id,
            strategy = %outcome.strategy,
            version = outcome.version,
            already_applied = outcome.already_applied,
            "re-evaluation finished"
        );
        let entry = AuditEntry::new(CORRECTION_BRIDGE, "reevaluate", AuditEvent::Reevaluated, severity)
            .intent_id(outcome.intent_id)
            .correlation_id(outcome.correlation_id)
            .detail("correction_id", outcome.correction_id.to_string())
            .detail("source", correction.source.as_str())
            .detail("reason", correction.reason.clone())
            .detail("attempts", outcome.attempts)
            .detail("strategy", outcome.strategy.to_string())
            .detail("already_applied", outcome.already_applied)
            .detail("version", outcome.version);
        emit(self.audit.as_ref(), entry).await;
    }
}
