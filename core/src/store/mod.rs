//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Services call store methods, they never execute SQL directly.
//! Timestamps are stored as Unix epoch seconds.

use crate::{
    error::RecoveryResult,
    event::{AuditLogEntry, RecoveryEvent},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

mod account;
mod analytics;
mod campaign;
mod failure;

pub struct RecoveryStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for files and URIs
}

impl RecoveryStore {
    pub fn open(path: &str) -> RecoveryResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an isolated in-memory database (used in store-level tests).
    pub fn in_memory() -> RecoveryResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Shared-cache in-memory database: every connection opened with the
    /// same tag sees the same data. This is how the engine and its
    /// services share one database in tests and the runner.
    pub fn open_shared_memory(tag: &str) -> RecoveryResult<Self> {
        Self::open(&format!("file:{tag}?mode=memory&cache=shared"))
    }

    /// Reopen a new connection to the same database.
    /// For isolated in-memory databases this returns a fresh, empty one.
    pub fn reopen(&self) -> RecoveryResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> RecoveryResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_payment_failures.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_dunning_campaigns.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_account_states.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_analytics.sql"))?;
        Ok(())
    }

    // ── Audit trail ────────────────────────────────────────────

    pub fn append_audit(
        &self,
        actor: &str,
        subsystem: &str,
        event: &RecoveryEvent,
        occurred_at: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO audit_log (actor, subsystem, event_type, payload, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![actor, subsystem, event.type_name(), payload, to_ts(occurred_at)],
        )?;
        Ok(())
    }

    /// Denials are security events: they leave no entity rows behind,
    /// but they always leave an audit entry.
    pub fn record_access_denied(
        &self,
        actor: &str,
        subsystem: &str,
        action: &str,
        occurred_at: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        log::warn!("access denied: actor={actor} action={action}");
        self.append_audit(
            actor,
            subsystem,
            &RecoveryEvent::AccessDeniedAttempt {
                actor: actor.to_string(),
                action: action.to_string(),
                at: occurred_at,
            },
            occurred_at,
        )
    }

    pub fn audit_count(&self, event_type: &str) -> RecoveryResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM audit_log WHERE event_type = ?1",
                params![event_type],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    pub fn audit_total(&self) -> RecoveryResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(Into::into)
    }

    pub fn audit_entries(&self, event_type: &str) -> RecoveryResult<Vec<AuditLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, actor, subsystem, event_type, payload, occurred_at
             FROM audit_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], |row| {
                Ok(AuditLogEntry {
                    id: Some(row.get(0)?),
                    actor: row.get(1)?,
                    subsystem: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                    occurred_at: from_ts(row.get(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ── Timestamp helpers ──────────────────────────────────────────

pub(crate) fn to_ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

pub(crate) fn to_ts_opt(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_ts)
}

pub(crate) fn from_ts_opt(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(from_ts)
}
