//! Daily metric rollup queries.

use super::{from_ts, to_ts, RecoveryStore};
use crate::{
    analytics::{
        AnalyticsFilter, CommunicationRollupRow, FailureRollupRow, RecoveryAnalyticsRecord,
    },
    error::RecoveryResult,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;

impl RecoveryStore {
    /// Failures created inside the window, grouped by the linked
    /// campaign's (type, segment). Failures without a campaign fall
    /// into ("none", "general").
    pub fn failure_rollup_for_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RecoveryResult<Vec<FailureRollupRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(c.campaign_type, 'none'),
                    COALESCE(c.customer_segment, 'general'),
                    COUNT(*),
                    SUM(CASE WHEN f.status = 'resolved' THEN 1 ELSE 0 END),
                    COALESCE(SUM(CASE WHEN f.status = 'resolved' THEN f.amount ELSE 0 END), 0.0)
             FROM payment_failure f
             LEFT JOIN dunning_campaign c ON c.payment_failure_id = f.failure_id
             WHERE f.created_at >= ?1 AND f.created_at < ?2
             GROUP BY 1, 2",
        )?;
        let rows = stmt.query_map(params![to_ts(start), to_ts(end)], |row| {
            Ok(FailureRollupRow {
                campaign_type: row.get(0)?,
                customer_segment: row.get(1)?,
                total: row.get(2)?,
                resolved: row.get(3)?,
                revenue_recovered: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn communication_rollup_for_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RecoveryResult<Vec<CommunicationRollupRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.campaign_type, c.customer_segment, COUNT(*), COALESCE(SUM(cc.opened), 0)
             FROM campaign_communication cc
             JOIN dunning_campaign c ON c.campaign_id = cc.campaign_id
             WHERE cc.sent_at >= ?1 AND cc.sent_at < ?2
             GROUP BY 1, 2",
        )?;
        let rows = stmt.query_map(params![to_ts(start), to_ts(end)], |row| {
            Ok(CommunicationRollupRow {
                campaign_type: row.get(0)?,
                customer_segment: row.get(1)?,
                sent: row.get(2)?,
                opened: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn upsert_daily_metrics(&self, r: &RecoveryAnalyticsRecord) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT INTO recovery_daily_metrics (
                metric_date, campaign_type, customer_segment, total_failures,
                resolved_failures, recovery_rate, revenue_recovered,
                communications_sent, open_rate, generated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(metric_date, campaign_type, customer_segment) DO UPDATE SET
                total_failures = excluded.total_failures,
                resolved_failures = excluded.resolved_failures,
                recovery_rate = excluded.recovery_rate,
                revenue_recovered = excluded.revenue_recovered,
                communications_sent = excluded.communications_sent,
                open_rate = excluded.open_rate,
                generated_at = excluded.generated_at",
            params![
                r.metric_date.to_string(),
                r.campaign_type,
                r.customer_segment,
                r.total_failures,
                r.resolved_failures,
                r.recovery_rate,
                r.revenue_recovered,
                r.communications_sent,
                r.open_rate,
                to_ts(r.generated_at),
            ],
        )?;
        Ok(())
    }

    pub fn daily_metrics(
        &self,
        filter: &AnalyticsFilter,
    ) -> RecoveryResult<Vec<RecoveryAnalyticsRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT metric_date, campaign_type, customer_segment, total_failures,
                    resolved_failures, recovery_rate, revenue_recovered,
                    communications_sent, open_rate, generated_at
             FROM recovery_daily_metrics
             WHERE (?1 IS NULL OR metric_date >= ?1)
               AND (?2 IS NULL OR metric_date <= ?2)
               AND (?3 IS NULL OR campaign_type = ?3)
             ORDER BY metric_date ASC, campaign_type ASC, customer_segment ASC",
        )?;
        let rows = stmt.query_map(
            params![
                filter.from.map(|d| d.to_string()),
                filter.to.map(|d| d.to_string()),
                filter.campaign_type,
            ],
            |row| {
                let date: String = row.get(0)?;
                Ok(RecoveryAnalyticsRecord {
                    metric_date: date.parse::<NaiveDate>().unwrap_or_default(),
                    campaign_type: row.get(1)?,
                    customer_segment: row.get(2)?,
                    total_failures: row.get(3)?,
                    resolved_failures: row.get(4)?,
                    recovery_rate: row.get(5)?,
                    revenue_recovered: row.get(6)?,
                    communications_sent: row.get(7)?,
                    open_rate: row.get(8)?,
                    generated_at: from_ts(row.get(9)?),
                })
            },
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Test / summary helpers ─────────────────────────────────

    pub fn daily_metrics_row_count(&self) -> RecoveryResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM recovery_daily_metrics", [], |row| {
                row.get(0)
            })
            .map_err(Into::into)
    }
}
