use super::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque intent identifier.
///
/// Ordered by the underlying UUID bytes; multi-id lock acquisition sorts on this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// `true` for an id that has not been assigned yet.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IntentId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|err| BridgeError::InvalidValue(format!("intent id '{s}': {err}")))
    }
}

fn normalize_label(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

// ============================================================================
// Intent status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Received,
    Normalized,
    Processed,
    Corrected,
    Completed,
    Failed,
}

impl IntentStatus {
    pub const ALL: [IntentStatus; 6] = [
        Self::Received,
        Self::Normalized,
        Self::Processed,
        Self::Corrected,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Processed => "processed",
            Self::Corrected => "corrected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Position along the pipeline. Terminal states share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Normalized => 1,
            Self::Processed => 2,
            Self::Corrected => 3,
            Self::Completed | Self::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Strict lifecycle graph used for explicit status updates.
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Received => matches!(next, Self::Normalized | Self::Failed),
            Self::Normalized => matches!(next, Self::Processed | Self::Completed | Self::Failed),
            Self::Processed => matches!(next, Self::Corrected | Self::Completed | Self::Failed),
            Self::Corrected => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    pub fn validate_transition(&self, next: IntentStatus) -> Result<(), BridgeError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(BridgeError::InvalidStatus {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "received" | "recorded" => Ok(Self::Received),
            "normalized" => Ok(Self::Normalized),
            "processed" | "ai_processed" => Ok(Self::Processed),
            "corrected" | "reevaluated" | "feedback_collected" => Ok(Self::Corrected),
            "completed" | "closed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(BridgeError::InvalidValue(format!("unknown intent status '{s}'"))),
        }
    }
}

// ============================================================================
// Actors
// ============================================================================

/// Technical component that requested a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalActor {
    User,
    Engine,
    Daemon,
    System,
    Dashboard,
    Api,
    TestSuite,
}

impl TechnicalActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Engine => "engine",
            Self::Daemon => "daemon",
            Self::System => "system",
            Self::Dashboard => "dashboard",
            Self::Api => "api",
            Self::TestSuite => "test_suite",
        }
    }
}

impl Default for TechnicalActor {
    fn default() -> Self {
        Self::System
    }
}

impl fmt::Display for TechnicalActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TechnicalActor {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "user" => Ok(Self::User),
            "engine" | "kana" => Ok(Self::Engine),
            "daemon" | "tsumu" => Ok(Self::Daemon),
            "system" | "yuno" => Ok(Self::System),
            "dashboard" => Ok(Self::Dashboard),
            "api" => Ok(Self::Api),
            "test_suite" => Ok(Self::TestSuite),
            _ => Err(BridgeError::InvalidValue(format!("unknown technical actor '{s}'"))),
        }
    }
}

/// Reasoning layer on whose behalf a mutation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhilosophicalActor {
    Yuno,
    Kana,
    Tsumu,
}

impl PhilosophicalActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yuno => "yuno",
            Self::Kana => "kana",
            Self::Tsumu => "tsumu",
        }
    }
}

impl Default for PhilosophicalActor {
    fn default() -> Self {
        Self::Kana
    }
}

impl fmt::Display for PhilosophicalActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhilosophicalActor {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "yuno" => Ok(Self::Yuno),
            "kana" => Ok(Self::Kana),
            "tsumu" => Ok(Self::Tsumu),
            _ => Err(BridgeError::InvalidValue(format!(
                "unknown philosophical actor '{s}'"
            ))),
        }
    }
}

// ============================================================================
// Pipeline stages and audit vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStage {
    Input,
    Normalize,
    AiJudge,
    Feedback,
    Output,
}

impl BridgeStage {
    /// Fixed execution order of the pipeline.
    pub const ORDER: [BridgeStage; 5] = [
        Self::Input,
        Self::Normalize,
        Self::AiJudge,
        Self::Feedback,
        Self::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Normalize => "normalize",
            Self::AiJudge => "ai_judge",
            Self::Feedback => "feedback",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for BridgeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    IntentReceived,
    IntentCompleted,
    IntentFailed,
    BridgeStarted,
    BridgeCompleted,
    BridgeFailed,
    Reevaluated,
    StatusChanged,
    StarvationFallback,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntentReceived => "intent_received",
            Self::IntentCompleted => "intent_completed",
            Self::IntentFailed => "intent_failed",
            Self::BridgeStarted => "bridge_started",
            Self::BridgeCompleted => "bridge_completed",
            Self::BridgeFailed => "bridge_failed",
            Self::Reevaluated => "reevaluated",
            Self::StatusChanged => "status_changed",
            Self::StarvationFallback => "starvation_fallback",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
