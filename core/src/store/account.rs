//! Account state history queries.
//!
//! History is append-only; "current" is the row with the greatest
//! updated_at (id breaks ties within one second).

use super::{from_ts, from_ts_opt, to_ts, to_ts_opt, RecoveryStore};
use crate::{
    account_state::{AccountState, AccountStateKind},
    error::{RecoveryError, RecoveryResult},
};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    OptionalExtension, Row, ToSql,
};

impl ToSql for AccountStateKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for AccountStateKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

const ACCOUNT_COLUMNS: &str = "id, customer_id, state, reason, grace_period_end,
            suspension_date, reactivation_date, feature_restrictions, manual_override,
            override_reason, override_by, previous_state, created_at, updated_at";

fn account_row_mapper(row: &Row<'_>) -> rusqlite::Result<AccountState> {
    let restrictions: String = row.get(7)?;
    Ok(AccountState {
        id: Some(row.get(0)?),
        customer_id: row.get(1)?,
        state: row.get(2)?,
        reason: row.get(3)?,
        grace_period_end: from_ts_opt(row.get(4)?),
        suspension_date: from_ts_opt(row.get(5)?),
        reactivation_date: from_ts_opt(row.get(6)?),
        feature_restrictions: serde_json::from_str(&restrictions).unwrap_or_default(),
        manual_override: row.get::<_, i32>(8)? != 0,
        override_reason: row.get(9)?,
        override_by: row.get(10)?,
        previous_state: row.get(11)?,
        created_at: from_ts(row.get(12)?),
        updated_at: from_ts(row.get(13)?),
    })
}

impl RecoveryStore {
    pub fn append_account_state(&self, s: &AccountState) -> RecoveryResult<i64> {
        let restrictions = serde_json::to_string(&s.feature_restrictions)?;
        self.conn.execute(
            "INSERT INTO account_state (
                customer_id, state, reason, grace_period_end, suspension_date,
                reactivation_date, feature_restrictions, manual_override,
                override_reason, override_by, previous_state, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                s.customer_id,
                s.state,
                s.reason,
                to_ts_opt(s.grace_period_end),
                to_ts_opt(s.suspension_date),
                to_ts_opt(s.reactivation_date),
                restrictions,
                i32::from(s.manual_override),
                s.override_reason,
                s.override_by,
                s.previous_state,
                to_ts(s.created_at),
                to_ts(s.updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn account_state_by_id(&self, id: i64) -> RecoveryResult<AccountState> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM account_state WHERE id = ?1");
        self.conn
            .query_row(&query, params![id], account_row_mapper)
            .optional()?
            .ok_or_else(|| RecoveryError::NotFound {
                entity: "account state",
                id: id.to_string(),
            })
    }

    pub fn latest_account_state(&self, customer_id: &str) -> RecoveryResult<Option<AccountState>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM account_state
             WHERE customer_id = ?1
             ORDER BY updated_at DESC, id DESC LIMIT 1"
        );
        self.conn
            .query_row(&query, params![customer_id], account_row_mapper)
            .optional()
            .map_err(Into::into)
    }

    pub fn account_state_history(&self, customer_id: &str) -> RecoveryResult<Vec<AccountState>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM account_state
             WHERE customer_id = ?1
             ORDER BY updated_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![customer_id], account_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn customers_with_account_history(&self) -> RecoveryResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT customer_id FROM account_state ORDER BY customer_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Test / summary helpers ─────────────────────────────────

    pub fn account_state_row_count(&self, customer_id: &str) -> RecoveryResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM account_state WHERE customer_id = ?1",
                params![customer_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}
