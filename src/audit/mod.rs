// ============================================================================
// Audit Sinks
// ============================================================================
//
// Every stage transition, committed correction, status change and starvation
// fallback is reported to an `AuditSink`. Recording is awaited by the caller;
// a sink failure is logged and never undoes the mutation it describes.
//
// ============================================================================

use crate::core::{AuditEvent, BridgeStage, Intent, IntentId, Result, Severity};
use crate::diff::Payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{Level, event};
use uuid::Uuid;

/// Component name recorded for correction-service entries.
pub const CORRECTION_BRIDGE: &str = "correction";
/// Component name recorded for store-level status updates.
pub const STATUS_BRIDGE: &str = "status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub bridge_type: String,
    pub operation: String,
    pub details: Payload,
    pub intent_id: Option<IntentId>,
    pub correlation_id: Option<Uuid>,
    pub event: AuditEvent,
    pub severity: Severity,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        bridge_type: impl Into<String>,
        operation: impl Into<String>,
        event: AuditEvent,
        severity: Severity,
    ) -> Self {
        Self {
            bridge_type: bridge_type.into(),
            operation: operation.into(),
            details: Payload::new(),
            intent_id: None,
            correlation_id: None,
            event,
            severity,
            recorded_at: Utc::now(),
        }
    }

    /// Entry for a pipeline stage; `bridge_type` is the stage name.
    pub fn for_stage(stage: BridgeStage, event: AuditEvent, severity: Severity) -> Self {
        Self::new(stage.as_str(), "execute", event, severity)
    }

    /// Tags the entry with the intent's id and correlation id.
    pub fn intent(mut self, intent: &Intent) -> Self {
        self.intent_id = Some(intent.id);
        self.correlation_id = Some(intent.correlation_id);
        self
    }

    pub fn intent_id(mut self, id: IntentId) -> Self {
        self.intent_id = Some(id);
        self
    }

    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail_flag(&self, key: &str) -> bool {
        self.details.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Keeps every entry in memory, in recording order.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn with_event(&self, event: AuditEvent) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.event == event)
            .cloned()
            .collect()
    }

    pub async fn count_severity(&self, severity: Severity) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.severity == severity)
            .count()
    }

    pub async fn for_intent(&self, id: &IntentId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.intent_id.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

/// Forwards entries to `tracing`, mapping severity onto log level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        let details = serde_json::to_string(&entry.details)?;
        let intent_id = entry.intent_id.map(|id| id.to_string()).unwrap_or_default();
        let correlation_id = entry
            .correlation_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        match entry.severity {
            Severity::Debug => event!(
                Level::DEBUG,
                bridge = %entry.bridge_type,
                operation = %entry.operation,
                event = %entry.event,
                intent_id = %intent_id,
                correlation_id = %correlation_id,
                details = %details,
                "audit"
            ),
            Severity::Info => event!(
                Level::INFO,
                bridge = %entry.bridge_type,
                operation = %entry.operation,
                event = %entry.event,
                intent_id = %intent_id,
                correlation_id = %correlation_id,
                details = %details,
                "audit"
            ),
            Severity::Warning => event!(
                Level::WARN,
                bridge = %entry.bridge_type,
                operation = %entry.operation,
                event = %entry.event,
                intent_id = %intent_id,
                correlation_id = %correlation_id,
                details = %details,
                "audit"
            ),
            Severity::Error | Severity::Critical => event!(
                Level::ERROR,
                bridge = %entry.bridge_type,
                operation = %entry.operation,
                event = %entry.event,
                severity = %entry.severity,
                intent_id = %intent_id,
                correlation_id = %correlation_id,
                details = %details,
                "audit"
            ),
        }
        Ok(())
    }
}

/// Records `entry`, logging instead of failing when the sink errors.
pub(crate) async fn emit(sink: &dyn AuditSink, entry: AuditEntry) {
    let event = entry.event;
    if let Err(err) = sink.record(entry).await {
        event!(Level::ERROR, event = %event, error = %err, "audit sink rejected entry");
    }
}
