//! Store trait definitions

use chrono::{DateTime, Utc};
use janitor_util::{MachineId, Username};
use serde::{Deserialize, Serialize};

use crate::{AuditEvent, StoreResult};

/// Data access used by the policy checks
pub trait Store: Send + Sync {
    // Users

    /// Insert or replace a user record
    fn upsert_user(&self, user: &UserRecord) -> StoreResult<()>;

    /// Users whose last login is at or before `cutoff`, ordered by username
    fn users_inactive_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<UserRecord>>;

    /// Users with the given account status, ordered by username
    fn users_with_status(&self, status: UserStatus) -> StoreResult<Vec<UserRecord>>;

    // Machines

    /// Register a machine
    fn add_machine(&self, machine: &MachineRecord) -> StoreResult<()>;

    /// Machines owned by a user
    fn machines_owned_by(&self, username: &Username) -> StoreResult<Vec<MachineRecord>>;

    /// Forget a machine; returns whether it existed
    fn remove_machine(&self, machine_id: &MachineId) -> StoreResult<bool>;

    // Warning history

    /// Most recent warning recorded for a user
    fn latest_warning(&self, username: &Username) -> StoreResult<Option<WarningRecord>>;

    /// Record that a warning level was acted upon for a user
    fn record_warning(&self, username: &Username, level: u8, at: DateTime<Utc>)
        -> StoreResult<()>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Lifecycle

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;

    /// Release the underlying handle. Idempotent; later operations fail with `Closed`.
    fn close(&self) -> StoreResult<()>;
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Blocked,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(UserStatus::Active),
            "blocked" => Some(UserStatus::Blocked),
            _ => None,
        }
    }
}

/// A machine owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: Username,
    pub email: String,
    pub status: UserStatus,
    pub last_login_at: DateTime<Utc>,
    /// Paying accounts are never warned or cleaned up for inactivity
    pub paid: bool,
}

/// A virtual machine known to the janitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub machine_id: MachineId,
    pub owner: Username,
    pub label: String,
    pub provider: String,
}

/// One entry in a user's warning history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub username: Username,
    pub level: u8,
    pub issued_at: DateTime<Utc>,
}
