//! Dunning campaign and communication queries.

use super::{from_ts, from_ts_opt, to_ts, to_ts_opt, RecoveryStore};
use crate::{
    dunning_engine::{
        CampaignCommunication, CampaignFilter, CampaignStatus, CampaignStepStatus, DunningCampaign,
    },
    error::{RecoveryError, RecoveryResult},
};
use chrono::{DateTime, Utc};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    OptionalExtension, Row, ToSql,
};

impl ToSql for CampaignStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for CampaignStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

impl ToSql for CampaignStepStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for CampaignStepStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

const CAMPAIGN_COLUMNS: &str = "campaign_id, customer_id, payment_failure_id, campaign_type,
            customer_segment, sequence_step, total_steps, status, current_step_status,
            started_at, completed_at, next_communication_at, last_communication_at,
            communication_channels, ab_test_group, personalization, metadata,
            created_at, updated_at";

fn campaign_row_mapper(row: &Row<'_>) -> rusqlite::Result<DunningCampaign> {
    let channels: String = row.get(13)?;
    let personalization: String = row.get(15)?;
    let metadata: String = row.get(16)?;
    Ok(DunningCampaign {
        campaign_id: row.get(0)?,
        customer_id: row.get(1)?,
        payment_failure_id: row.get(2)?,
        campaign_type: row.get(3)?,
        customer_segment: row.get(4)?,
        sequence_step: row.get(5)?,
        total_steps: row.get(6)?,
        status: row.get(7)?,
        current_step_status: row.get(8)?,
        started_at: from_ts(row.get(9)?),
        completed_at: from_ts_opt(row.get(10)?),
        next_communication_at: from_ts_opt(row.get(11)?),
        last_communication_at: from_ts_opt(row.get(12)?),
        communication_channels: serde_json::from_str(&channels).unwrap_or_default(),
        ab_test_group: row.get(14)?,
        personalization: serde_json::from_str(&personalization)
            .unwrap_or(serde_json::Value::Null),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: from_ts(row.get(17)?),
        updated_at: from_ts(row.get(18)?),
    })
}

impl RecoveryStore {
    pub fn insert_campaign(&self, c: &DunningCampaign) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT INTO dunning_campaign (
                campaign_id, customer_id, payment_failure_id, campaign_type,
                customer_segment, sequence_step, total_steps, status, current_step_status,
                started_at, completed_at, next_communication_at, last_communication_at,
                communication_channels, ab_test_group, personalization, metadata,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19)",
            params![
                c.campaign_id,
                c.customer_id,
                c.payment_failure_id,
                c.campaign_type,
                c.customer_segment,
                c.sequence_step,
                c.total_steps,
                c.status,
                c.current_step_status,
                to_ts(c.started_at),
                to_ts_opt(c.completed_at),
                to_ts_opt(c.next_communication_at),
                to_ts_opt(c.last_communication_at),
                serde_json::to_string(&c.communication_channels)?,
                c.ab_test_group,
                serde_json::to_string(&c.personalization)?,
                serde_json::to_string(&c.metadata)?,
                to_ts(c.created_at),
                to_ts(c.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn update_campaign_row(&self, c: &DunningCampaign) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE dunning_campaign SET
                sequence_step = ?2, total_steps = ?3, status = ?4, current_step_status = ?5,
                completed_at = ?6, next_communication_at = ?7, last_communication_at = ?8,
                communication_channels = ?9, personalization = ?10, metadata = ?11,
                updated_at = ?12
             WHERE campaign_id = ?1",
            params![
                c.campaign_id,
                c.sequence_step,
                c.total_steps,
                c.status,
                c.current_step_status,
                to_ts_opt(c.completed_at),
                to_ts_opt(c.next_communication_at),
                to_ts_opt(c.last_communication_at),
                serde_json::to_string(&c.communication_channels)?,
                serde_json::to_string(&c.personalization)?,
                serde_json::to_string(&c.metadata)?,
                to_ts(c.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_campaign(&self, campaign_id: &str) -> RecoveryResult<DunningCampaign> {
        let query =
            format!("SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaign WHERE campaign_id = ?1");
        self.conn
            .query_row(&query, params![campaign_id], campaign_row_mapper)
            .optional()?
            .ok_or_else(|| RecoveryError::NotFound {
                entity: "dunning campaign",
                id: campaign_id.to_string(),
            })
    }

    pub fn campaign_for_failure(
        &self,
        failure_id: &str,
    ) -> RecoveryResult<Option<DunningCampaign>> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaign WHERE payment_failure_id = ?1"
        );
        self.conn
            .query_row(&query, params![failure_id], campaign_row_mapper)
            .optional()
            .map_err(Into::into)
    }

    pub fn due_campaigns(&self, now: DateTime<Utc>) -> RecoveryResult<Vec<DunningCampaign>> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaign
             WHERE status = 'active'
               AND next_communication_at IS NOT NULL AND next_communication_at <= ?1
             ORDER BY next_communication_at ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![to_ts(now)], campaign_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Optimistic claim on the current step: clears next_communication_at
    /// while the campaign is still active on the expected step. Returns
    /// false when a concurrent worker or a fresher state got there first.
    pub fn claim_campaign_step(
        &self,
        campaign_id: &str,
        expected_step: u32,
        now: DateTime<Utc>,
    ) -> RecoveryResult<bool> {
        let changed = self.conn.execute(
            "UPDATE dunning_campaign
                SET next_communication_at = NULL, updated_at = ?3
              WHERE campaign_id = ?1 AND status = 'active' AND sequence_step = ?2
                AND next_communication_at IS NOT NULL",
            params![campaign_id, expected_step, to_ts(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn reschedule_campaign_step(
        &self,
        campaign_id: &str,
        next_communication_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE dunning_campaign
                SET next_communication_at = ?2, current_step_status = 'retry_scheduled',
                    updated_at = ?3
              WHERE campaign_id = ?1",
            params![campaign_id, to_ts(next_communication_at), to_ts(now)],
        )?;
        Ok(())
    }

    pub fn advance_campaign_step(
        &self,
        campaign_id: &str,
        next_step: u32,
        next_communication_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE dunning_campaign
                SET sequence_step = ?2, next_communication_at = ?3,
                    last_communication_at = ?4, current_step_status = 'scheduled',
                    updated_at = ?4
              WHERE campaign_id = ?1",
            params![
                campaign_id,
                next_step,
                to_ts(next_communication_at),
                to_ts(now)
            ],
        )?;
        Ok(())
    }

    pub fn mark_campaign_final_step_sent(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE dunning_campaign
                SET last_communication_at = ?2, current_step_status = 'sent', updated_at = ?2
              WHERE campaign_id = ?1",
            params![campaign_id, to_ts(now)],
        )?;
        Ok(())
    }

    pub fn finish_campaign(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> RecoveryResult<()> {
        self.conn.execute(
            "UPDATE dunning_campaign
                SET status = ?2, completed_at = ?3, next_communication_at = NULL,
                    updated_at = ?3
              WHERE campaign_id = ?1",
            params![campaign_id, status, to_ts(now)],
        )?;
        Ok(())
    }

    pub fn list_campaigns(
        &self,
        filter: &CampaignFilter,
    ) -> RecoveryResult<Vec<DunningCampaign>> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaign
             WHERE (?1 IS NULL OR customer_id = ?1)
               AND (?2 IS NULL OR payment_failure_id = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at DESC, campaign_id ASC
             LIMIT ?4"
        );
        let limit = i64::from(filter.limit.unwrap_or(100));
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![
                filter.customer_id,
                filter.payment_failure_id,
                filter.status,
                limit
            ],
            campaign_row_mapper,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Communications ─────────────────────────────────────────

    pub fn insert_communication(&self, c: &CampaignCommunication) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT INTO campaign_communication (
                communication_id, campaign_id, sequence_step, channel, template,
                receipt_id, sent_at, opened
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                c.communication_id,
                c.campaign_id,
                c.sequence_step,
                c.channel,
                c.template,
                c.receipt_id,
                to_ts(c.sent_at),
                i32::from(c.opened),
            ],
        )?;
        Ok(())
    }

    pub fn mark_communication_opened(
        &self,
        receipt_id: &str,
        opened: bool,
    ) -> RecoveryResult<bool> {
        let changed = self.conn.execute(
            "UPDATE campaign_communication SET opened = ?2 WHERE receipt_id = ?1",
            params![receipt_id, i32::from(opened)],
        )?;
        Ok(changed > 0)
    }

    pub fn communications_for_campaign(
        &self,
        campaign_id: &str,
    ) -> RecoveryResult<Vec<CampaignCommunication>> {
        let mut stmt = self.conn.prepare(
            "SELECT communication_id, campaign_id, sequence_step, channel, template,
                    receipt_id, sent_at, opened
             FROM campaign_communication
             WHERE campaign_id = ?1
             ORDER BY sent_at ASC, communication_id ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id], |row| {
            Ok(CampaignCommunication {
                communication_id: row.get(0)?,
                campaign_id: row.get(1)?,
                sequence_step: row.get(2)?,
                channel: row.get(3)?,
                template: row.get(4)?,
                receipt_id: row.get(5)?,
                sent_at: from_ts(row.get(6)?),
                opened: row.get::<_, i32>(7)? != 0,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Test / summary helpers ─────────────────────────────────

    pub fn communication_count(&self, campaign_id: &str) -> RecoveryResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM campaign_communication WHERE campaign_id = ?1",
                params![campaign_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    pub fn campaign_count_by_status(&self, status: CampaignStatus) -> RecoveryResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM dunning_campaign WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}
