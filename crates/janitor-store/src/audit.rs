//! Audit event types

use chrono::{DateTime, Utc};
use janitor_util::{MachineId, Username};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// A warning level was recorded for a user
    WarningIssued {
        username: Username,
        check: String,
        level: u8,
    },

    /// The orchestration service accepted a machine deletion
    MachineDeleted {
        machine_id: MachineId,
        username: Username,
        check: String,
    },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: janitor_util::now(),
            event,
        }
    }
}
