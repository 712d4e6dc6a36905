use super::error::{BridgeError, Result};
use super::types::{IntentId, IntentStatus, PhilosophicalActor, TechnicalActor};
use crate::diff::{Diff, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Namespace for deterministic correction ids.
const CORRECTION_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b810_9dad_11d1_80b4_00c04fd430c8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionId(Uuid);

impl CorrectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives a stable id from the target intent and the canonical diff, so a
    /// retried request without an explicit id dedupes against its first delivery.
    pub fn derive(intent_id: &IntentId, diff: &Diff) -> Result<Self> {
        let canonical = diff.canonical_json()?;
        let name = format!("{intent_id}:{canonical}");
        Ok(Self(Uuid::new_v5(&CORRECTION_NAMESPACE, name.as_bytes())))
    }
}

impl Default for CorrectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub correction_id: CorrectionId,
    pub diff: Diff,
    pub reason: String,
    pub source: PhilosophicalActor,
    pub applied_at: DateTime<Utc>,
}

/// A correction as requested, before it is applied to any particular version.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub correction_id: CorrectionId,
    pub diff: Diff,
    pub reason: String,
    pub source: PhilosophicalActor,
}

/// Result of applying a correction to an in-memory intent value.
#[derive(Debug, Clone)]
pub enum CorrectionApplied {
    /// The intent carries the merged payload and the appended record.
    Applied { intent: Intent, record: CorrectionRecord },
    /// The id is already in the history; nothing changed.
    AlreadyApplied { record: CorrectionRecord },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub intent_type: String,
    pub payload: Payload,
    pub status: IntentStatus,
    pub version: u64,
    pub correction_history: Vec<CorrectionRecord>,
    pub technical_actor: TechnicalActor,
    pub philosophical_actor: PhilosophicalActor,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    pub const INITIAL_VERSION: u64 = 0;

    /// Creates a fresh intent: new id, `RECEIVED`, version 0, empty history.
    pub fn new(intent_type: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: IntentId::new(),
            intent_type: intent_type.into(),
            payload,
            status: IntentStatus::Received,
            version: Self::INITIAL_VERSION,
            correction_history: Vec::new(),
            technical_actor: TechnicalActor::default(),
            philosophical_actor: PhilosophicalActor::default(),
            correlation_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Like [`Intent::new`] but takes any JSON value; non-objects are rejected.
    pub fn from_json(intent_type: impl Into<String>, payload: Value) -> Result<Self> {
        match payload {
            Value::Object(object) => Ok(Self::new(intent_type, object)),
            other => Err(BridgeError::InvalidValue(format!(
                "intent payload must be an object, got {other}"
            ))),
        }
    }

    pub fn with_id(mut self, id: IntentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_actors(mut self, technical: TechnicalActor, philosophical: PhilosophicalActor) -> Self {
        self.technical_actor = technical;
        self.philosophical_actor = philosophical;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn find_correction(&self, correction_id: &CorrectionId) -> Option<&CorrectionRecord> {
        self.correction_history
            .iter()
            .find(|record| &record.correction_id == correction_id)
    }

    pub fn has_correction(&self, correction_id: &CorrectionId) -> bool {
        self.find_correction(correction_id).is_some()
    }

    /// Moves status forward along the pipeline. Targets at or behind the
    /// current rank are ignored, and `FAILED` is never left.
    pub fn advance_status(&mut self, target: IntentStatus) {
        if self.status == IntentStatus::Failed {
            return;
        }
        if target == IntentStatus::Failed || target.rank() > self.status.rank() {
            self.status = target;
        }
    }

    /// Explicit status change along the strict lifecycle graph.
    pub fn transition_to(&mut self, next: IntentStatus) -> Result<()> {
        self.status.validate_transition(next)?;
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Applies `correction` to a copy of this intent.
    ///
    /// The version is left untouched; the store bumps it when the copy commits.
    pub fn apply_correction(&self, correction: &Correction) -> Result<CorrectionApplied> {
        if let Some(existing) = self.find_correction(&correction.correction_id) {
            return Ok(CorrectionApplied::AlreadyApplied {
                record: existing.clone(),
            });
        }

        let payload = correction.diff.apply(&self.payload)?;
        let record = CorrectionRecord {
            correction_id: correction.correction_id,
            diff: correction.diff.clone(),
            reason: correction.reason.clone(),
            source: correction.source,
            applied_at: Utc::now(),
        };

        let mut intent = self.clone();
        intent.payload = payload;
        intent.correction_history.push(record.clone());
        if intent.status == IntentStatus::Processed {
            intent.status = IntentStatus::Corrected;
        }
        intent.updated_at = record.applied_at;

        Ok(CorrectionApplied::Applied { intent, record })
    }
}
