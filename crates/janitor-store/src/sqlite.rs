//! SQLite-based store implementation

use chrono::{DateTime, TimeZone, Utc};
use janitor_util::{MachineId, Username};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    AuditEvent, MachineRecord, Store, StoreError, StoreResult, UserRecord, UserStatus,
    WarningRecord,
};

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                -- Machine owners
                CREATE TABLE IF NOT EXISTS users (
                    username TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    status TEXT NOT NULL,
                    last_login_at INTEGER NOT NULL,
                    paid INTEGER NOT NULL DEFAULT 0
                );

                -- Machines
                CREATE TABLE IF NOT EXISTS machines (
                    machine_id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    label TEXT NOT NULL,
                    provider TEXT NOT NULL
                );

                -- Warning history
                CREATE TABLE IF NOT EXISTS warnings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL,
                    level INTEGER NOT NULL,
                    issued_at INTEGER NOT NULL
                );

                -- Audit log (append-only)
                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    event_json TEXT NOT NULL
                );

                -- Indexes
                CREATE INDEX IF NOT EXISTS idx_users_last_login ON users(last_login_at);
                CREATE INDEX IF NOT EXISTS idx_users_status ON users(status);
                CREATE INDEX IF NOT EXISTS idx_machines_owner ON machines(owner);
                CREATE INDEX IF NOT EXISTS idx_warnings_user ON warnings(username, issued_at);
                "#,
            )?;

            debug!("Store schema initialized");
            Ok(())
        })
    }

    fn query_users(&self, sql: &str, param: rusqlite::types::Value) -> StoreResult<Vec<UserRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([param], |row| {
                let username: String = row.get(0)?;
                let email: String = row.get(1)?;
                let status: String = row.get(2)?;
                let last_login_at: i64 = row.get(3)?;
                let paid: bool = row.get(4)?;
                Ok((username, email, status, last_login_at, paid))
            })?;

            let mut users = Vec::new();
            for row in rows {
                let (username, email, status, last_login_at, paid) = row?;
                let status = UserStatus::parse(&status).ok_or_else(|| {
                    StoreError::Serialization(format!("unknown user status '{}'", status))
                })?;

                users.push(UserRecord {
                    username: Username::new(username),
                    email,
                    status,
                    last_login_at: from_unix(last_login_at)?,
                    paid,
                });
            }

            Ok(users)
        })
    }
}

fn from_unix(secs: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", secs)))
}

impl Store for SqliteStore {
    fn upsert_user(&self, user: &UserRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO users (username, email, status, last_login_at, paid)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(username)
                DO UPDATE SET email = excluded.email,
                              status = excluded.status,
                              last_login_at = excluded.last_login_at,
                              paid = excluded.paid
                "#,
                params![
                    user.username.as_str(),
                    user.email,
                    user.status.as_str(),
                    user.last_login_at.timestamp(),
                    user.paid
                ],
            )?;

            debug!(username = %user.username, "User upserted");
            Ok(())
        })
    }

    fn users_inactive_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<UserRecord>> {
        self.query_users(
            "SELECT username, email, status, last_login_at, paid FROM users \
             WHERE last_login_at <= ? ORDER BY username",
            cutoff.timestamp().into(),
        )
    }

    fn users_with_status(&self, status: UserStatus) -> StoreResult<Vec<UserRecord>> {
        self.query_users(
            "SELECT username, email, status, last_login_at, paid FROM users \
             WHERE status = ? ORDER BY username",
            status.as_str().to_string().into(),
        )
    }

    fn add_machine(&self, machine: &MachineRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO machines (machine_id, owner, label, provider)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(machine_id)
                DO UPDATE SET owner = excluded.owner,
                              label = excluded.label,
                              provider = excluded.provider
                "#,
                params![
                    machine.machine_id.as_str(),
                    machine.owner.as_str(),
                    machine.label,
                    machine.provider
                ],
            )?;
            Ok(())
        })
    }

    fn machines_owned_by(&self, username: &Username) -> StoreResult<Vec<MachineRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT machine_id, owner, label, provider FROM machines \
                 WHERE owner = ? ORDER BY machine_id",
            )?;

            let rows = stmt.query_map([username.as_str()], |row| {
                let machine_id: String = row.get(0)?;
                let owner: String = row.get(1)?;
                Ok(MachineRecord {
                    machine_id: MachineId::new(machine_id),
                    owner: Username::new(owner),
                    label: row.get(2)?,
                    provider: row.get(3)?,
                })
            })?;

            let mut machines = Vec::new();
            for row in rows {
                machines.push(row?);
            }
            Ok(machines)
        })
    }

    fn remove_machine(&self, machine_id: &MachineId) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM machines WHERE machine_id = ?",
                [machine_id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    fn latest_warning(&self, username: &Username) -> StoreResult<Option<WarningRecord>> {
        self.with_conn(|conn| {
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT level, issued_at FROM warnings WHERE username = ? \
                     ORDER BY issued_at DESC, id DESC LIMIT 1",
                    [username.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((level, issued_at)) => Ok(Some(WarningRecord {
                    username: username.clone(),
                    level: u8::try_from(level).map_err(|_| {
                        StoreError::Serialization(format!("warning level out of range: {}", level))
                    })?,
                    issued_at: from_unix(issued_at)?,
                })),
                None => Ok(None),
            }
        })
    }

    fn record_warning(
        &self,
        username: &Username,
        level: u8,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO warnings (username, level, issued_at) VALUES (?, ?, ?)",
                params![username.as_str(), level, at.timestamp()],
            )?;

            debug!(username = %username, level, "Warning recorded");
            Ok(())
        })
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        self.with_conn(|conn| {
            let event_json = serde_json::to_string(&event.event)?;

            conn.execute(
                "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
                params![event.timestamp.to_rfc3339(), event_json],
            )?;

            event.id = conn.last_insert_rowid();
            debug!(event_id = event.id, "Audit event appended");

            Ok(())
        })
    }

    fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
            )?;

            let rows = stmt.query_map([limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let timestamp_str: String = row.get(1)?;
                let event_json: String = row.get(2)?;
                Ok((id, timestamp_str, event_json))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, timestamp_str, event_json) = row?;
                let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| janitor_util::now());
                let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

                events.push(AuditEvent {
                    id,
                    timestamp,
                    event,
                });
            }

            Ok(events)
        })
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
                None => false,
            },
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }

    fn close(&self) -> StoreResult<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))?;

        match guard.take() {
            Some(conn) => {
                conn.close().map_err(|(_, e)| StoreError::from(e))?;
                debug!("Store closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
