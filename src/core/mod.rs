pub mod error;
pub mod intent;
pub mod types;

pub use error::{BridgeError, ErrorClass, Result};
pub use intent::{Correction, CorrectionApplied, CorrectionId, CorrectionRecord, Intent};
pub use types::{
    AuditEvent, BridgeStage, IntentId, IntentStatus, PhilosophicalActor, Severity, TechnicalActor,
};
