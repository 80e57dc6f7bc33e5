//! Test doubles shared by the unit tests in this crate

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use janitor_api::{Action, ActionReceipt, ErrorCode};
use janitor_rpc::{RemoteActions, RpcError, RpcResult};
use janitor_store::{
    AuditEvent, MachineRecord, SqliteStore, Store, StoreError, StoreResult, UserRecord, UserStatus,
    WarningRecord,
};
use janitor_util::{MachineId, Username};
use std::sync::{Arc, Mutex};

use crate::CheckContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Rejected,
}

/// Records every action; optionally fails some or all of them
#[derive(Default)]
pub struct RecordingRemote {
    actions: Mutex<Vec<Action>>,
    fail_all: Mutex<Option<Failure>>,
    fail_users: Mutex<Vec<(Username, Failure)>>,
    fail_machines: Mutex<Vec<(MachineId, Failure)>>,
}

impl RecordingRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_all(&self, failure: Failure) {
        *self.fail_all.lock().unwrap() = Some(failure);
    }

    pub fn fail_user(&self, username: &str, failure: Failure) {
        self.fail_users
            .lock()
            .unwrap()
            .push((Username::new(username), failure));
    }

    pub fn fail_machine(&self, machine_id: &str, failure: Failure) {
        self.fail_machines
            .lock()
            .unwrap()
            .push((MachineId::new(machine_id), failure));
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteActions for RecordingRemote {
    async fn issue(&self, action: Action) -> RpcResult<ActionReceipt> {
        let failure = self.fail_all.lock().unwrap().or_else(|| {
            self.fail_users
                .lock()
                .unwrap()
                .iter()
                .find(|(u, _)| u == action.username())
                .map(|(_, f)| *f)
        });
        let failure = failure.or_else(|| match &action {
            Action::DeleteMachine { machine_id, .. } => self
                .fail_machines
                .lock()
                .unwrap()
                .iter()
                .find(|(m, _)| m == machine_id)
                .map(|(_, f)| *f),
            Action::NotifyOwner { .. } => None,
        });

        match failure {
            Some(Failure::Transient) => Err(RpcError::Transient("reconnecting".into())),
            Some(Failure::Rejected) => Err(RpcError::Rejected {
                code: ErrorCode::Rejected,
                message: "refused".into(),
            }),
            None => {
                let mut actions = self.actions.lock().unwrap();
                actions.push(action);
                Ok(ActionReceipt {
                    action_id: format!("action-{}", actions.len()),
                    accepted_at: Utc::now(),
                })
            }
        }
    }
}

/// SQLite store whose per-user reads fail for one username
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    broken: Username,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>, broken: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken: Username::new(broken),
        })
    }

    fn check(&self, username: &Username) -> StoreResult<()> {
        if *username == self.broken {
            return Err(StoreError::Database("boom".into()));
        }
        Ok(())
    }
}

impl Store for FlakyStore {
    fn upsert_user(&self, user: &UserRecord) -> StoreResult<()> {
        self.inner.upsert_user(user)
    }

    fn users_inactive_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<UserRecord>> {
        self.inner.users_inactive_since(cutoff)
    }

    fn users_with_status(&self, status: UserStatus) -> StoreResult<Vec<UserRecord>> {
        self.inner.users_with_status(status)
    }

    fn add_machine(&self, machine: &MachineRecord) -> StoreResult<()> {
        self.inner.add_machine(machine)
    }

    fn machines_owned_by(&self, username: &Username) -> StoreResult<Vec<MachineRecord>> {
        self.check(username)?;
        self.inner.machines_owned_by(username)
    }

    fn remove_machine(&self, machine_id: &MachineId) -> StoreResult<bool> {
        self.inner.remove_machine(machine_id)
    }

    fn latest_warning(&self, username: &Username) -> StoreResult<Option<WarningRecord>> {
        self.check(username)?;
        self.inner.latest_warning(username)
    }

    fn record_warning(&self, username: &Username, level: u8, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.record_warning(username, level, at)
    }

    fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
        self.inner.append_audit(event)
    }

    fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.inner.recent_audits(limit)
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}

pub fn tick_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap()
}

pub fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().unwrap())
}

pub fn context(store: Arc<SqliteStore>, remote: Arc<RecordingRemote>) -> CheckContext {
    CheckContext {
        store,
        remote,
        now: tick_time(),
        tick: janitor_util::TickId::new(),
    }
}

/// Insert a user last seen `inactive_days` before the tick, owning `machines`
pub fn seed_user(store: &SqliteStore, name: &str, inactive_days: i64, machines: &[&str]) -> UserRecord {
    let user = UserRecord {
        username: Username::new(name),
        email: format!("{}@example.com", name),
        status: UserStatus::Active,
        last_login_at: tick_time() - Duration::days(inactive_days),
        paid: false,
    };
    store.upsert_user(&user).unwrap();

    for id in machines {
        store
            .add_machine(&MachineRecord {
                machine_id: MachineId::new(*id),
                owner: user.username.clone(),
                label: id.to_string(),
                provider: "aws".into(),
            })
            .unwrap();
    }

    user
}
