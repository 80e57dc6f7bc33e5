//! Shared types for the orchestration protocol

use chrono::{DateTime, Utc};
use janitor_util::{MachineId, Username};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential kind the orchestration service expects from this worker
pub const JANITOR_CREDENTIAL_KIND: &str = "janitor";

/// Authentication presented on every new connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
}

impl Credential {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Credential of kind `janitor` with the given secret key
    pub fn janitor(key: impl Into<String>) -> Self {
        Self::new(JANITOR_CREDENTIAL_KIND, key)
    }
}

// Keep the secret out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Something the orchestration service is asked to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Tell the owner their machines will be deleted unless they come back
    NotifyOwner {
        username: Username,
        email: String,
        warning_level: u8,
        days_until_deletion: u32,
    },

    /// Destroy a machine
    DeleteMachine {
        machine_id: MachineId,
        username: Username,
    },
}

impl Action {
    /// The account the action concerns
    pub fn username(&self) -> &Username {
        match self {
            Action::NotifyOwner { username, .. } => username,
            Action::DeleteMachine { username, .. } => username,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Action::NotifyOwner { .. } => "notify_owner",
            Action::DeleteMachine { .. } => "delete_machine",
        }
    }
}

/// Acknowledgement returned for an accepted action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    /// Identifier assigned by the orchestration service
    pub action_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_hides_key() {
        let cred = Credential::janitor("hunter2");
        let shown = format!("{:?}", cred);

        assert!(shown.contains("janitor"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_action_accessors() {
        let action = Action::NotifyOwner {
            username: Username::new("bob"),
            email: "bob@example.com".into(),
            warning_level: 1,
            days_until_deletion: 10,
        };

        assert_eq!(action.username().as_str(), "bob");
        assert_eq!(action.kind(), "notify_owner");
    }
}
