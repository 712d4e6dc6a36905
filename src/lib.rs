// ============================================================================
// bridge-lite Library
// ============================================================================
//
// Concurrency control and correction application for versioned intents that
// move through a staged pipeline while independent actors mutate them.
//
// ============================================================================

pub mod audit;
pub mod config;
pub mod core;
pub mod correction;
pub mod diff;
pub mod pipeline;
pub mod retry;
pub mod storage;

// Re-export main types for convenience
pub use core::{
    AuditEvent, BridgeError, BridgeStage, Correction, CorrectionId, CorrectionRecord, ErrorClass,
    Intent, IntentId, IntentStatus, PhilosophicalActor, Result, Severity, TechnicalActor,
};

pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{ConcurrencyConfig, ExecutionMode, LockStrategy};
pub use correction::{ApplyStrategy, CorrectionService, ReevaluationOutcome, ReevaluationRequest};
pub use diff::{Diff, DiffOp, Payload};
pub use pipeline::{
    AcceptingFeedback, AiJudge, CorrectionPlan, FeedbackBridge, FeedbackJudgment,
    PipelineOrchestrator, PipelineStage, RuleBasedJudge,
};
pub use retry::{RetryPolicy, with_deadlock_retry};
pub use storage::{
    FaultHook, InMemoryIntentStore, IntentFilter, IntentStore, LockFault, LockOwner, LockSession,
    ScriptedFaults, commit_all, lock_many_ordered,
};
