//! Payment failure and processor event queries.

use super::{from_ts, from_ts_opt, to_ts, to_ts_opt, RecoveryStore};
use crate::{
    error::{RecoveryError, RecoveryResult},
    failure_tracker::{FailureFilter, FailureStatus, PaymentFailure, ResolutionType},
};
use chrono::{DateTime, Utc};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    OptionalExtension, Row, ToSql,
};

impl ToSql for FailureStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for FailureStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

impl ToSql for ResolutionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ResolutionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

const FAILURE_COLUMNS: &str = "failure_id, customer_id, subscription_id, amount, currency,
            failure_reason, failure_code, status, retry_count, max_retry_attempts,
            next_retry_at, last_retry_at, resolution_type, resolved_at,
            created_at, updated_at";

fn failure_row_mapper(row: &Row<'_>) -> rusqlite::Result<PaymentFailure> {
    Ok(PaymentFailure {
        failure_id: row.get(0)?,
        customer_id: row.get(1)?,
        subscription_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        failure_reason: row.get(5)?,
        failure_code: row.get(6)?,
        status: row.get(7)?,
        retry_count: row.get(8)?,
        max_retry_attempts: row.get(9)?,
        next_retry_at: from_ts_opt(row.get(10)?),
        last_retry_at: from_ts_opt(row.get(11)?),
        resolution_type: row.get(12)?,
        resolved_at: from_ts_opt(row.get(13)?),
        created_at: from_ts(row.get(14)?),
        updated_at: from_ts(row.get(15)?),
    })
}

impl RecoveryStore {
    pub fn insert_failure(&self, f: &PaymentFailure) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT INTO payment_failure (
                failure_id, customer_id, subscription_id, amount, currency,
                failure_reason, failure_code, status, retry_count, max_retry_attempts,
                next_retry_at, last_retry_at, resolution_type, resolved_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                f.failure_id,
                f.customer_id,
                f.subscription_id,
                f.amount,
                f.currency,
                f.failure_reason,
                f.failure_code,
                f.status,
                f.retry_count,
                f.max_retry_attempts,
                to_ts_opt(f.next_retry_at),
                to_ts_opt(f.last_retry_at),
                f.resolution_type,
                to_ts_opt(f.resolved_at),
                to_ts(f.created_at),
                to_ts(f.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn update_failure(&self, f: &PaymentFailure) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE payment_failure SET
                amount = ?2, currency = ?3, failure_reason = ?4, failure_code = ?5,
                status = ?6, retry_count = ?7, max_retry_attempts = ?8,
                next_retry_at = ?9, last_retry_at = ?10, resolution_type = ?11,
                resolved_at = ?12, updated_at = ?13
             WHERE failure_id = ?1",
            params![
                f.failure_id,
                f.amount,
                f.currency,
                f.failure_reason,
                f.failure_code,
                f.status,
                f.retry_count,
                f.max_retry_attempts,
                to_ts_opt(f.next_retry_at),
                to_ts_opt(f.last_retry_at),
                f.resolution_type,
                to_ts_opt(f.resolved_at),
                to_ts(f.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_failure(&self, failure_id: &str) -> RecoveryResult<PaymentFailure> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM payment_failure WHERE failure_id = ?1"
        );
        self.conn
            .query_row(&query, params![failure_id], failure_row_mapper)
            .optional()?
            .ok_or_else(|| RecoveryError::NotFound {
                entity: "payment failure",
                id: failure_id.to_string(),
            })
    }

    /// The open failure for a (customer, subscription) pair, if any.
    /// Open means not yet resolved or abandoned.
    pub fn find_open_failure(
        &self,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) -> RecoveryResult<Option<PaymentFailure>> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM payment_failure
             WHERE customer_id = ?1
               AND status IN ('pending', 'retrying', 'escalated')
               AND ((?2 IS NULL AND subscription_id IS NULL) OR subscription_id = ?2)
             ORDER BY created_at ASC LIMIT 1"
        );
        self.conn
            .query_row(&query, params![customer_id, subscription_id], failure_row_mapper)
            .optional()
            .map_err(Into::into)
    }

    // ── Processor event dedupe ─────────────────────────────────

    pub fn processor_event_failure(&self, idempotency_key: &str) -> RecoveryResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT failure_id FROM processor_event WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn record_processor_event(
        &self,
        idempotency_key: &str,
        failure_id: &str,
        received_at: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO processor_event (idempotency_key, failure_id, received_at)
             VALUES (?1, ?2, ?3)",
            params![idempotency_key, failure_id, to_ts(received_at)],
        )?;
        Ok(())
    }

    // ── Retry lifecycle ────────────────────────────────────────

    /// Optimistic claim: flips the row to retrying and clears
    /// next_retry_at, but only while the status still matches what the
    /// caller loaded. Returns false when a concurrent worker got there
    /// first or the state moved on.
    pub fn claim_failure_for_retry(
        &self,
        failure_id: &str,
        expected: FailureStatus,
        now: DateTime<Utc>,
    ) -> RecoveryResult<bool> {
        let changed = self.conn.execute(
            "UPDATE payment_failure
                SET status = 'retrying', next_retry_at = NULL,
                    last_retry_at = ?2, updated_at = ?2
              WHERE failure_id = ?1 AND status = ?3 AND next_retry_at IS NOT NULL",
            params![failure_id, to_ts(now), expected],
        )?;
        Ok(changed == 1)
    }

    pub fn resolve_failure(
        &self,
        failure_id: &str,
        resolution: ResolutionType,
        now: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE payment_failure
                SET status = 'resolved', resolution_type = ?2, resolved_at = ?3,
                    next_retry_at = NULL, updated_at = ?3
              WHERE failure_id = ?1",
            params![failure_id, resolution, to_ts(now)],
        )?;
        Ok(())
    }

    pub fn abandon_failure(&self, failure_id: &str, now: DateTime<Utc>) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE payment_failure
                SET status = 'abandoned', resolution_type = 'abandoned', resolved_at = ?2,
                    next_retry_at = NULL, updated_at = ?2
              WHERE failure_id = ?1",
            params![failure_id, to_ts(now)],
        )?;
        Ok(())
    }

    pub fn reschedule_failure(
        &self,
        failure_id: &str,
        status: FailureStatus,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE payment_failure
                SET status = ?2, retry_count = ?3, next_retry_at = ?4, updated_at = ?5
              WHERE failure_id = ?1",
            params![
                failure_id,
                status,
                retry_count,
                to_ts(next_retry_at),
                to_ts(now)
            ],
        )?;
        Ok(())
    }

    /// Rows the retry sweep should execute. Escalated rows keep their
    /// schedule stamp but are excluded; only an admin moves them.
    pub fn due_retries(&self, now: DateTime<Utc>) -> RecoveryResult<Vec<PaymentFailure>> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM payment_failure
             WHERE status IN ('pending', 'retrying')
               AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![to_ts(now)], failure_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn list_failures(&self, filter: &FailureFilter) -> RecoveryResult<Vec<PaymentFailure>> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM payment_failure
             WHERE (?1 IS NULL OR customer_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, failure_id ASC
             LIMIT ?3"
        );
        let limit = i64::from(filter.limit.unwrap_or(100));
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![filter.customer_id, filter.status, limit],
            failure_row_mapper,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Account state machine inputs ───────────────────────────

    /// Everything that still weighs on the customer's account: open
    /// failures plus abandoned ones (abandonment keeps an account
    /// suspended until an admin intervenes).
    pub fn unresolved_failures_for_customer(
        &self,
        customer_id: &str,
    ) -> RecoveryResult<Vec<PaymentFailure>> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM payment_failure
             WHERE customer_id = ?1 AND status != 'resolved'
             ORDER BY created_at ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![customer_id], failure_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn customers_with_unresolved_failures(&self) -> RecoveryResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT customer_id FROM payment_failure
             WHERE status != 'resolved' ORDER BY customer_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Dunning engine inputs ──────────────────────────────────

    /// Open failures that have consumed enough retries to qualify for a
    /// campaign and do not have one yet.
    pub fn failures_qualifying_for_campaign(
        &self,
        min_retry_count: u32,
    ) -> RecoveryResult<Vec<PaymentFailure>> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM payment_failure f
             WHERE f.status IN ('pending', 'retrying', 'escalated')
               AND f.retry_count >= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM dunning_campaign c
                    WHERE c.payment_failure_id = f.failure_id
               )
             ORDER BY f.created_at ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![min_retry_count], failure_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Test / summary helpers ─────────────────────────────────

    pub fn failure_count_by_status(&self, status: FailureStatus) -> RecoveryResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM payment_failure WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    pub fn failure_count_total(&self) -> RecoveryResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM payment_failure", [], |row| row.get(0))
            .map_err(Into::into)
    }
}
