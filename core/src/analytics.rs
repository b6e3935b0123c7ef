//! Daily recovery metric rollups.
//!
//! One row per (date, campaign type, customer segment), recomputed from
//! the failure and communication tables and upserted idempotently, so
//! regenerating a day is always safe.

use crate::{
    error::RecoveryResult,
    event::RecoveryEvent,
    store::RecoveryStore,
    sweep::SweepTask,
};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SUBSYSTEM: &str = "analytics";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAnalyticsRecord {
    pub metric_date: NaiveDate,
    pub campaign_type: String,
    pub customer_segment: String,
    pub total_failures: i64,
    pub resolved_failures: i64,
    pub recovery_rate: f64,
    pub revenue_recovered: f64,
    pub communications_sent: i64,
    pub open_rate: f64,
    pub generated_at: DateTime<Utc>,
}

/// Per-group failure counts for one day window. Failures with no
/// campaign land in ("none", "general").
#[derive(Debug, Clone)]
pub struct FailureRollupRow {
    pub campaign_type: String,
    pub customer_segment: String,
    pub total: i64,
    pub resolved: i64,
    pub revenue_recovered: f64,
}

#[derive(Debug, Clone)]
pub struct CommunicationRollupRow {
    pub campaign_type: String,
    pub customer_segment: String,
    pub sent: i64,
    pub opened: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub campaign_type: Option<String>,
}

pub struct AnalyticsAggregator {
    store: RecoveryStore,
}

impl AnalyticsAggregator {
    pub fn new(store: RecoveryStore) -> Self {
        Self { store }
    }

    /// Recompute and upsert the metric rows for one day.
    pub fn generate_daily_metrics(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> RecoveryResult<Vec<RecoveryAnalyticsRecord>> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = date
            .checked_add_days(Days::new(1))
            .unwrap_or(date)
            .and_time(NaiveTime::MIN)
            .and_utc();

        let mut grouped: BTreeMap<(String, String), RecoveryAnalyticsRecord> = BTreeMap::new();
        for row in self.store.failure_rollup_for_window(start, end)? {
            let key = (row.campaign_type.clone(), row.customer_segment.clone());
            let record = grouped
                .entry(key)
                .or_insert_with(|| empty_record(date, &row.campaign_type, &row.customer_segment, now));
            record.total_failures = row.total;
            record.resolved_failures = row.resolved;
            record.revenue_recovered = row.revenue_recovered;
        }
        for row in self.store.communication_rollup_for_window(start, end)? {
            let key = (row.campaign_type.clone(), row.customer_segment.clone());
            let record = grouped
                .entry(key)
                .or_insert_with(|| empty_record(date, &row.campaign_type, &row.customer_segment, now));
            record.communications_sent = row.sent;
            record.open_rate = rate(row.opened, row.sent);
        }

        let mut records: Vec<RecoveryAnalyticsRecord> = grouped.into_values().collect();
        for record in &mut records {
            record.recovery_rate = rate(record.resolved_failures, record.total_failures);
            self.store.upsert_daily_metrics(record)?;
        }

        self.store.append_audit(
            "system",
            SUBSYSTEM,
            &RecoveryEvent::DailyMetricsGenerated {
                date,
                rows: records.len(),
                at: now,
            },
            now,
        )?;
        log::debug!("daily metrics for {date}: {} rows", records.len());
        Ok(records)
    }

    pub fn get_analytics(
        &self,
        filter: &AnalyticsFilter,
    ) -> RecoveryResult<Vec<RecoveryAnalyticsRecord>> {
        self.store.daily_metrics(filter)
    }
}

impl SweepTask for AnalyticsAggregator {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> RecoveryResult<Vec<RecoveryEvent>> {
        let date = now.date_naive();
        let rows = self.generate_daily_metrics(date, now)?;
        Ok(vec![RecoveryEvent::DailyMetricsGenerated {
            date,
            rows: rows.len(),
            at: now,
        }])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn empty_record(
    date: NaiveDate,
    campaign_type: &str,
    customer_segment: &str,
    now: DateTime<Utc>,
) -> RecoveryAnalyticsRecord {
    RecoveryAnalyticsRecord {
        metric_date: date,
        campaign_type: campaign_type.to_string(),
        customer_segment: customer_segment.to_string(),
        total_failures: 0,
        resolved_failures: 0,
        recovery_rate: 0.0,
        revenue_recovered: 0.0,
        communications_sent: 0,
        open_rate: 0.0,
        generated_at: now,
    }
}

fn rate(part: i64, whole: i64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}
