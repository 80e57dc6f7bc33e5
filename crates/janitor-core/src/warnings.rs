//! The warning catalogue
//!
//! Owners of machines that sit idle get two notices before their machines are
//! deleted; blocked users lose their machines outright. Each step is a
//! [`Warning`]: an immutable description of who is selected, what history
//! makes them due, who is exempt and what happens to them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use janitor_api::Action;
use janitor_rpc::RpcError;
use janitor_store::{AuditEvent, AuditEventType, MachineRecord, UserRecord, UserStatus, WarningRecord};
use tracing::{debug, info, warn};

use crate::{CheckContext, CheckError, CheckOutcome, PolicyCheck};

/// Which users a warning looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Last login at least this many days before the tick
    InactiveFor { days: u32 },
    /// Account status is blocked
    Blocked,
}

/// Warning history a user needs before a warning applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousWarning {
    /// No warning since the user last logged in
    NoWarning,
    /// History is ignored
    Any,
    /// The latest warning has this level and is at least this old
    After { level: u8, at_least: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    PaidAccount,
    NoMachines,
    BlockedAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningAction {
    /// Tell the owner their machines go away in this many days
    Notify { days_until_deletion: u32 },
    /// Delete every machine the user owns
    DeleteMachines,
}

/// One step of the catalogue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub name: &'static str,
    pub level: u8,
    pub selector: Selector,
    pub previous: PreviousWarning,
    pub exemptions: &'static [Exemption],
    pub action: WarningAction,
}

const INACTIVE_EXEMPTIONS: &[Exemption] = &[
    Exemption::PaidAccount,
    Exemption::NoMachines,
    Exemption::BlockedAccount,
];

/// The production catalogue, in the order it runs
pub fn default_warnings() -> Vec<Warning> {
    vec![
        Warning {
            name: "vm-deletion-warning-1",
            level: 1,
            selector: Selector::InactiveFor { days: 20 },
            previous: PreviousWarning::NoWarning,
            exemptions: INACTIVE_EXEMPTIONS,
            action: WarningAction::Notify {
                days_until_deletion: 10,
            },
        },
        Warning {
            name: "vm-deletion-warning-2",
            level: 2,
            selector: Selector::InactiveFor { days: 25 },
            previous: PreviousWarning::After {
                level: 1,
                at_least: janitor_util::days(4),
            },
            exemptions: INACTIVE_EXEMPTIONS,
            action: WarningAction::Notify {
                days_until_deletion: 5,
            },
        },
        Warning {
            name: "delete-inactive-user-vm",
            level: 3,
            selector: Selector::InactiveFor { days: 30 },
            previous: PreviousWarning::After {
                level: 2,
                at_least: janitor_util::days(5),
            },
            exemptions: INACTIVE_EXEMPTIONS,
            action: WarningAction::DeleteMachines,
        },
        Warning {
            name: "delete-blocked-user-vm",
            level: 4,
            selector: Selector::Blocked,
            previous: PreviousWarning::Any,
            exemptions: &[Exemption::NoMachines],
            action: WarningAction::DeleteMachines,
        },
    ]
}

/// Scratch state for one evaluation; never outlives it
#[derive(Default)]
struct Tally {
    candidates: usize,
    exempt: usize,
    not_due: usize,
    attempted: usize,
    affected: usize,
    failed: usize,
    transient_failures: usize,
    last_transient: Option<RpcError>,
}

enum UserOutcome {
    Exempt(Exemption),
    NotDue,
    /// Number of users notified or machines deleted
    Acted(usize),
    /// `done` counts remote actions accepted before the failure
    Failed { done: usize, error: CheckError },
}

impl Warning {
    fn exemption_for(&self, user: &UserRecord, machines: &[MachineRecord]) -> Option<Exemption> {
        self.exemptions.iter().copied().find(|exemption| match exemption {
            Exemption::PaidAccount => user.paid,
            Exemption::NoMachines => machines.is_empty(),
            Exemption::BlockedAccount => user.status == UserStatus::Blocked,
        })
    }

    fn is_due(&self, latest: Option<&WarningRecord>, now: DateTime<Utc>) -> bool {
        match self.previous {
            PreviousWarning::NoWarning => latest.is_none(),
            PreviousWarning::Any => true,
            PreviousWarning::After { level, at_least } => {
                latest.is_some_and(|w| w.level == level && now - w.issued_at >= at_least)
            }
        }
    }

    /// Everything that happens to one candidate. Store and remote failures
    /// stay with that user.
    async fn handle_user(&self, ctx: &CheckContext, user: &UserRecord) -> UserOutcome {
        let machines = match ctx.store.machines_owned_by(&user.username) {
            Ok(machines) => machines,
            Err(e) => {
                return UserOutcome::Failed {
                    done: 0,
                    error: e.into(),
                };
            }
        };

        if let Some(exemption) = self.exemption_for(user, &machines) {
            return UserOutcome::Exempt(exemption);
        }

        // A warning sent before the user's latest login no longer counts.
        let latest = match ctx.store.latest_warning(&user.username) {
            Ok(latest) => latest.filter(|w| w.issued_at > user.last_login_at),
            Err(e) => {
                return UserOutcome::Failed {
                    done: 0,
                    error: e.into(),
                };
            }
        };
        if !self.is_due(latest.as_ref(), ctx.now) {
            return UserOutcome::NotDue;
        }

        self.act_on(ctx, user, &machines).await
    }

    async fn act_on(
        &self,
        ctx: &CheckContext,
        user: &UserRecord,
        machines: &[MachineRecord],
    ) -> UserOutcome {
        match self.action {
            WarningAction::Notify {
                days_until_deletion,
            } => {
                let action = Action::NotifyOwner {
                    username: user.username.clone(),
                    email: user.email.clone(),
                    warning_level: self.level,
                    days_until_deletion,
                };
                if let Err(e) = ctx.remote.issue(action).await {
                    return UserOutcome::Failed {
                        done: 0,
                        error: e.into(),
                    };
                }

                match self.record(ctx, user) {
                    Ok(()) => UserOutcome::Acted(1),
                    Err(error) => UserOutcome::Failed { done: 1, error },
                }
            }
            WarningAction::DeleteMachines => {
                let mut deleted = 0;
                for machine in machines {
                    let action = Action::DeleteMachine {
                        machine_id: machine.machine_id.clone(),
                        username: user.username.clone(),
                    };
                    if let Err(e) = ctx.remote.issue(action).await {
                        return UserOutcome::Failed {
                            done: deleted,
                            error: e.into(),
                        };
                    }

                    deleted += 1;
                    let forgotten = ctx.store.remove_machine(&machine.machine_id).and_then(|_| {
                        ctx.store.append_audit(AuditEvent::new(AuditEventType::MachineDeleted {
                            machine_id: machine.machine_id.clone(),
                            username: user.username.clone(),
                            check: self.name.to_string(),
                        }))
                    });
                    if let Err(e) = forgotten {
                        return UserOutcome::Failed {
                            done: deleted,
                            error: e.into(),
                        };
                    }
                }

                match self.record(ctx, user) {
                    Ok(()) => UserOutcome::Acted(deleted),
                    Err(error) => UserOutcome::Failed {
                        done: deleted,
                        error,
                    },
                }
            }
        }
    }

    /// Persist that this level was acted upon
    fn record(&self, ctx: &CheckContext, user: &UserRecord) -> Result<(), CheckError> {
        ctx.store.record_warning(&user.username, self.level, ctx.now)?;
        ctx.store.append_audit(AuditEvent::new(AuditEventType::WarningIssued {
            username: user.username.clone(),
            check: self.name.to_string(),
            level: self.level,
        }))?;
        Ok(())
    }

    fn summary(&self, tally: &Tally) -> String {
        let verb = match self.action {
            WarningAction::Notify { .. } => "notified users",
            WarningAction::DeleteMachines => "deleted machines",
        };
        format!(
            "{}: {}, failed: {}, exempt: {}, not due: {}, candidates: {}",
            verb, tally.affected, tally.failed, tally.exempt, tally.not_due, tally.candidates
        )
    }
}

#[async_trait]
impl PolicyCheck for Warning {
    fn name(&self) -> &str {
        self.name
    }

    async fn evaluate(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        let candidates = match self.selector {
            Selector::InactiveFor { days } => ctx
                .store
                .users_inactive_since(ctx.now - janitor_util::days(days))?,
            Selector::Blocked => ctx.store.users_with_status(UserStatus::Blocked)?,
        };

        let mut tally = Tally {
            candidates: candidates.len(),
            ..Tally::default()
        };

        for user in &candidates {
            match self.handle_user(ctx, user).await {
                UserOutcome::Exempt(exemption) => {
                    debug!(check = self.name, username = %user.username, ?exemption, "User exempt");
                    tally.exempt += 1;
                }
                UserOutcome::NotDue => tally.not_due += 1,
                UserOutcome::Acted(count) => {
                    tally.attempted += 1;
                    tally.affected += count;
                    info!(
                        check = self.name,
                        tick = %ctx.tick,
                        username = %user.username,
                        level = self.level,
                        count,
                        "Warning applied"
                    );
                }
                UserOutcome::Failed { done, error } => {
                    warn!(
                        check = self.name,
                        tick = %ctx.tick,
                        username = %user.username,
                        done,
                        error = %error,
                        "Warning could not be applied"
                    );
                    tally.attempted += 1;
                    tally.affected += done;
                    tally.failed += 1;
                    if let CheckError::Remote(e) = error
                        && e.is_transient()
                    {
                        tally.transient_failures += 1;
                        tally.last_transient = Some(e);
                    }
                }
            }
        }

        if tally.attempted > 0
            && tally.affected == 0
            && tally.transient_failures == tally.attempted
            && let Some(e) = tally.last_transient.take()
        {
            return Err(CheckError::Remote(e));
        }

        Ok(CheckOutcome {
            affected: tally.affected,
            failed: tally.failed,
            message: self.summary(&tally),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::{
        Failure, FlakyStore, RecordingRemote, context, seed_user, store, tick_time,
    };
    use janitor_store::Store;
    use janitor_util::{MachineId, Username};

    fn warning(level: u8) -> Warning {
        default_warnings()
            .into_iter()
            .find(|w| w.level == level)
            .unwrap()
    }

    #[test]
    fn test_catalogue_order() {
        let names: Vec<_> = default_warnings().iter().map(|w| w.name).collect();
        assert_eq!(
            names,
            vec![
                "vm-deletion-warning-1",
                "vm-deletion-warning-2",
                "delete-inactive-user-vm",
                "delete-blocked-user-vm",
            ]
        );
    }

    #[tokio::test]
    async fn test_first_warning_notifies_inactive_owner() {
        let store = store();
        let remote = RecordingRemote::new();
        seed_user(&store, "idle", 21, &["vm-1"]);
        seed_user(&store, "active", 3, &["vm-2"]);

        let outcome = warning(1)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 1);
        assert_eq!(
            remote.actions(),
            vec![Action::NotifyOwner {
                username: Username::new("idle"),
                email: "idle@example.com".into(),
                warning_level: 1,
                days_until_deletion: 10,
            }]
        );
        let latest = store.latest_warning(&Username::new("idle")).unwrap().unwrap();
        assert_eq!(latest.level, 1);
        assert_eq!(latest.issued_at, tick_time());
    }

    #[tokio::test]
    async fn test_exemptions() {
        let store = store();
        let remote = RecordingRemote::new();

        let mut paid = seed_user(&store, "paid", 40, &["vm-1"]);
        paid.paid = true;
        store.upsert_user(&paid).unwrap();

        seed_user(&store, "empty", 40, &[]);

        let mut blocked = seed_user(&store, "blocked", 40, &["vm-2"]);
        blocked.status = UserStatus::Blocked;
        store.upsert_user(&blocked).unwrap();

        let outcome = warning(1)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 0);
        assert!(outcome.message.contains("exempt: 3"));
        assert!(remote.actions().is_empty());
    }

    #[tokio::test]
    async fn test_second_warning_waits_for_first_to_age() {
        let store = store();
        let remote = RecordingRemote::new();
        let fresh = seed_user(&store, "fresh", 26, &["vm-1"]);
        let aged = seed_user(&store, "aged", 26, &["vm-2"]);
        let never = seed_user(&store, "never", 26, &["vm-3"]);

        store
            .record_warning(&fresh.username, 1, tick_time() - Duration::days(3))
            .unwrap();
        store
            .record_warning(&aged.username, 1, tick_time() - Duration::days(4))
            .unwrap();

        let outcome = warning(2)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 1);
        assert!(outcome.message.contains("not due: 2"));
        assert_eq!(remote.actions().len(), 1);
        assert_eq!(remote.actions()[0].username(), &aged.username);
        assert!(store.latest_warning(&never.username).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletes_after_second_warning() {
        let store = store();
        let remote = RecordingRemote::new();
        let user = seed_user(&store, "gone", 31, &["vm-1", "vm-2"]);
        store
            .record_warning(&user.username, 1, tick_time() - Duration::days(11))
            .unwrap();
        store
            .record_warning(&user.username, 2, tick_time() - Duration::days(6))
            .unwrap();

        let outcome = warning(3)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 2);
        assert_eq!(
            remote.actions(),
            vec![
                Action::DeleteMachine {
                    machine_id: MachineId::new("vm-1"),
                    username: Username::new("gone"),
                },
                Action::DeleteMachine {
                    machine_id: MachineId::new("vm-2"),
                    username: Username::new("gone"),
                },
            ]
        );
        assert!(store.machines_owned_by(&user.username).unwrap().is_empty());
        assert_eq!(
            store.latest_warning(&user.username).unwrap().unwrap().level,
            3
        );

        let deletions = store
            .recent_audits(10)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.event, AuditEventType::MachineDeleted { .. }))
            .count();
        assert_eq!(deletions, 2);
    }

    #[tokio::test]
    async fn test_blocked_users_lose_machines_regardless_of_activity() {
        let store = store();
        let remote = RecordingRemote::new();
        let mut user = seed_user(&store, "mallory", 0, &["vm-1"]);
        user.status = UserStatus::Blocked;
        store.upsert_user(&user).unwrap();
        store
            .record_warning(&user.username, 1, tick_time() - Duration::days(1))
            .unwrap();

        let outcome = warning(4)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 1);
        assert!(store.machines_owned_by(&user.username).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_warning_before_last_login_is_ignored() {
        let store = store();
        let remote = RecordingRemote::new();
        let user = seed_user(&store, "returning", 22, &["vm-1"]);
        // Warned during an earlier idle spell, then logged back in.
        store
            .record_warning(&user.username, 2, user.last_login_at - Duration::days(30))
            .unwrap();

        let outcome = warning(1)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 1);
    }

    #[tokio::test]
    async fn test_one_failed_user_does_not_stop_the_check() {
        let store = store();
        let remote = RecordingRemote::new();
        seed_user(&store, "alice", 21, &["vm-1"]);
        seed_user(&store, "bob", 21, &["vm-2"]);
        remote.fail_user("alice", Failure::Rejected);

        let outcome = warning(1)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 1);
        assert_eq!(outcome.failed, 1);
        assert!(store.latest_warning(&Username::new("alice")).unwrap().is_none());
        assert!(store.latest_warning(&Username::new("bob")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_failure_for_one_user_keeps_others_counted() {
        let sqlite = store();
        let remote = RecordingRemote::new();
        for name in ["alice", "zed"] {
            let mut user = seed_user(&sqlite, name, 0, &[]);
            user.status = UserStatus::Blocked;
            sqlite.upsert_user(&user).unwrap();
        }
        sqlite
            .add_machine(&MachineRecord {
                machine_id: MachineId::new("vm-a"),
                owner: Username::new("alice"),
                label: "vm-a".into(),
                provider: "aws".into(),
            })
            .unwrap();

        let ctx = CheckContext {
            store: FlakyStore::new(sqlite.clone(), "zed"),
            remote: remote.clone(),
            now: tick_time(),
            tick: janitor_util::TickId::new(),
        };
        let outcome = warning(4).evaluate(&ctx).await.unwrap();

        assert_eq!(outcome.affected, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(remote.actions().len(), 1);
        assert!(
            sqlite
                .machines_owned_by(&Username::new("alice"))
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_store_failure_does_not_skip_later_users() {
        let sqlite = store();
        let remote = RecordingRemote::new();
        seed_user(&sqlite, "alice", 21, &["vm-1"]);
        seed_user(&sqlite, "bob", 21, &["vm-2"]);

        let ctx = CheckContext {
            store: FlakyStore::new(sqlite.clone(), "alice"),
            remote: remote.clone(),
            now: tick_time(),
            tick: janitor_util::TickId::new(),
        };
        let outcome = warning(1).evaluate(&ctx).await.unwrap();

        assert_eq!(outcome.affected, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(remote.actions()[0].username(), &Username::new("bob"));
    }

    #[tokio::test]
    async fn test_partial_deletion_counts_machines_already_deleted() {
        let store = store();
        let remote = RecordingRemote::new();
        let mut user = seed_user(&store, "mallory", 0, &["vm-1", "vm-2"]);
        user.status = UserStatus::Blocked;
        store.upsert_user(&user).unwrap();
        remote.fail_machine("vm-2", Failure::Transient);

        let outcome = warning(4)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.affected, 1);
        assert_eq!(outcome.failed, 1);
        let left: Vec<_> = store
            .machines_owned_by(&user.username)
            .unwrap()
            .into_iter()
            .map(|m| m.machine_id)
            .collect();
        assert_eq!(left, vec![MachineId::new("vm-2")]);
        // Not recorded, so the next tick retries the rest.
        assert!(store.latest_warning(&user.username).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_transient_failures_surface_as_transient() {
        let store = store();
        let remote = RecordingRemote::new();
        seed_user(&store, "alice", 21, &["vm-1"]);
        seed_user(&store, "bob", 21, &["vm-2"]);
        remote.fail_all(Failure::Transient);

        let error = warning(1)
            .evaluate(&context(store.clone(), remote.clone()))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::TransientRemoteFailure);
    }

    #[tokio::test]
    async fn test_each_run_starts_from_fresh_state() {
        let store = store();
        let remote = RecordingRemote::new();
        let check = warning(1);
        let ctx = context(store.clone(), remote.clone());

        seed_user(&store, "alice", 21, &["vm-1"]);
        seed_user(&store, "bob", 21, &["vm-2"]);
        let first = check.evaluate(&ctx).await.unwrap();
        assert_eq!(first.affected, 2);

        seed_user(&store, "carol", 21, &["vm-3"]);
        let second = check.evaluate(&ctx).await.unwrap();
        assert_eq!(second.affected, 1);
        assert_eq!(second.failed, 0);
        assert!(second.message.contains("not due: 2"));

        // The template itself never changes.
        assert_eq!(check, warning(1));
    }
}
