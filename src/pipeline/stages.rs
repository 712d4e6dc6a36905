use crate::config::ConcurrencyConfig;
use crate::core::{
    BridgeError, BridgeStage, Correction, CorrectionApplied, CorrectionId, Intent, IntentStatus,
    PhilosophicalActor, Result,
};
use crate::diff::{Diff, Payload};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{Level, event};

/// One step of intent processing.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn stage(&self) -> BridgeStage;

    async fn run(&self, intent: Intent) -> Result<Intent>;
}

/// Produces the analysis stored under `payload.analysis`.
#[async_trait]
pub trait AiJudge: Send + Sync {
    async fn judge(&self, intent: &Intent) -> Result<Payload>;
}

/// Correction the feedback collaborator wants applied to the in-flight intent.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionPlan {
    pub diff: Diff,
    pub reason: String,
    pub source: PhilosophicalActor,
    pub correction_id: Option<CorrectionId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedbackJudgment {
    pub evaluation: Payload,
    pub correction: Option<CorrectionPlan>,
}

#[async_trait]
pub trait FeedbackBridge: Send + Sync {
    async fn request_reevaluation(&self, intent: &Intent) -> Result<FeedbackJudgment>;
}

/// Deterministic judge that summarizes the payload shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedJudge;

#[async_trait]
impl AiJudge for RuleBasedJudge {
    async fn judge(&self, intent: &Intent) -> Result<Payload> {
        let mut analysis = Payload::new();
        analysis.insert("intent_type".into(), json!(intent.intent_type));
        analysis.insert("field_count".into(), json!(intent.payload.len()));
        analysis.insert("verdict".into(), json!("accepted"));
        Ok(analysis)
    }
}

/// Accepts every intent and never asks for a correction.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptingFeedback;

#[async_trait]
impl FeedbackBridge for AcceptingFeedback {
    async fn request_reevaluation(&self, _intent: &Intent) -> Result<FeedbackJudgment> {
        let mut evaluation = Payload::new();
        evaluation.insert("accepted".into(), Value::Bool(true));
        Ok(FeedbackJudgment {
            evaluation,
            correction: None,
        })
    }
}

pub struct InputStage;

#[async_trait]
impl PipelineStage for InputStage {
    fn stage(&self) -> BridgeStage {
        BridgeStage::Input
    }

    async fn run(&self, mut intent: Intent) -> Result<Intent> {
        if intent.intent_type.trim().is_empty() {
            return Err(BridgeError::stage(self.stage(), "intent_type is empty"));
        }
        intent
            .payload
            .entry("received_at")
            .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        Ok(intent)
    }
}

pub struct NormalizeStage;

#[async_trait]
impl PipelineStage for NormalizeStage {
    fn stage(&self) -> BridgeStage {
        BridgeStage::Normalize
    }

    async fn run(&self, mut intent: Intent) -> Result<Intent> {
        intent.payload.retain(|_, value| !value.is_null());
        intent.intent_type = intent.intent_type.trim().to_string();
        intent.advance_status(IntentStatus::Normalized);
        Ok(intent)
    }
}

pub struct AiJudgeStage {
    judge: Arc<dyn AiJudge>,
}

impl AiJudgeStage {
    pub fn new(judge: Arc<dyn AiJudge>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl PipelineStage for AiJudgeStage {
    fn stage(&self) -> BridgeStage {
        BridgeStage::AiJudge
    }

    async fn run(&self, mut intent: Intent) -> Result<Intent> {
        if !intent.payload.contains_key("analysis") {
            let analysis = self.judge.judge(&intent).await?;
            intent.payload.insert("analysis".into(), Value::Object(analysis));
        }
        intent.advance_status(IntentStatus::Processed);
        Ok(intent)
    }
}

pub struct FeedbackStage {
    bridge: Arc<dyn FeedbackBridge>,
    config: ConcurrencyConfig,
}

impl FeedbackStage {
    pub fn new(bridge: Arc<dyn FeedbackBridge>, config: ConcurrencyConfig) -> Self {
        Self { bridge, config }
    }

    /// Applies `plan` to the in-flight intent with the same idempotency rules
    /// as a stored correction.
    fn fold(&self, intent: Intent, plan: CorrectionPlan) -> Result<Intent> {
        if !self.config.is_authorized(plan.source) {
            return Err(BridgeError::UnauthorizedSource(plan.source.to_string()));
        }
        let correction_id = match plan.correction_id {
            Some(id) => id,
            None => CorrectionId::derive(&intent.id, &plan.diff)?,
        };
        let correction = Correction {
            correction_id,
            diff: plan.diff,
            reason: plan.reason,
            source: plan.source,
        };
        match intent.apply_correction(&correction)? {
            CorrectionApplied::Applied { intent, .. } => Ok(intent),
            CorrectionApplied::AlreadyApplied { .. } => {
                event!(
                    Level::DEBUG,
                    intent_id = %intent.id,
                    correction_id = %correction_id,
                    "feedback correction already applied"
                );
                Ok(intent)
            }
        }
    }
}

#[async_trait]
impl PipelineStage for FeedbackStage {
    fn stage(&self) -> BridgeStage {
        BridgeStage::Feedback
    }

    async fn run(&self, mut intent: Intent) -> Result<Intent> {
        let judgment = self.bridge.request_reevaluation(&intent).await?;
        intent
            .payload
            .insert("feedback".into(), Value::Object(judgment.evaluation));
        match judgment.correction {
            Some(plan) => self.fold(intent, plan),
            None => Ok(intent),
        }
    }
}

pub struct OutputStage;

#[async_trait]
impl PipelineStage for OutputStage {
    fn stage(&self) -> BridgeStage {
        BridgeStage::Output
    }

    async fn run(&self, mut intent: Intent) -> Result<Intent> {
        intent.advance_status(IntentStatus::Completed);
        Ok(intent)
    }
}

/// The five stages in pipeline order.
pub fn standard_stages(
    judge: Arc<dyn AiJudge>,
    feedback: Arc<dyn FeedbackBridge>,
    config: &ConcurrencyConfig,
) -> Vec<Arc<dyn PipelineStage>> {
    vec![
        Arc::new(InputStage),
        Arc::new(NormalizeStage),
        Arc::new(AiJudgeStage::new(judge)),
        Arc::new(FeedbackStage::new(feedback, config.clone())),
        Arc::new(OutputStage),
    ]
}
