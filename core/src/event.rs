//! Recovery events and the persisted audit trail.
//!
//! RULE: Whoever mutates, audits. Every state-changing operation appends
//! one entry per transition it performs, inside the operation itself, so
//! the trail is complete whether the change came from a sweep pass or an
//! on-demand call. Variants are added over time, never removed or
//! reordered.

use crate::types::EntityId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Every event emitted by the engine. Payloads carry the before/after
/// state a compliance reviewer needs to reconstruct the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryEvent {
    // ── Payment failure events ─────────────────────
    FailureRecorded {
        failure_id: EntityId,
        customer_id: EntityId,
        subscription_id: Option<EntityId>,
        amount: f64,
        currency: String,
        failure_code: String,
        at: DateTime<Utc>,
    },
    RetryAttempted {
        failure_id: EntityId,
        customer_id: EntityId,
        attempt: u32,
        outcome: String,
        at: DateTime<Utc>,
    },
    RetryRescheduled {
        failure_id: EntityId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    FailureResolved {
        failure_id: EntityId,
        customer_id: EntityId,
        previous_status: String,
        resolution_type: String,
        at: DateTime<Utc>,
    },
    FailureEscalated {
        failure_id: EntityId,
        customer_id: EntityId,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    FailureAbandoned {
        failure_id: EntityId,
        customer_id: EntityId,
        previous_status: String,
        reason: String,
        at: DateTime<Utc>,
    },

    // ── Dunning campaign events ────────────────────
    CampaignCreated {
        campaign_id: EntityId,
        customer_id: EntityId,
        payment_failure_id: EntityId,
        campaign_type: String,
        total_steps: u32,
        ab_test_group: String,
        at: DateTime<Utc>,
    },
    CampaignStepSent {
        campaign_id: EntityId,
        sequence_step: u32,
        channels: Vec<String>,
        at: DateTime<Utc>,
    },
    CampaignStepRescheduled {
        campaign_id: EntityId,
        sequence_step: u32,
        next_communication_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    CampaignCompleted {
        campaign_id: EntityId,
        reason: String,
        at: DateTime<Utc>,
    },
    CampaignCanceled {
        campaign_id: EntityId,
        reason: String,
        at: DateTime<Utc>,
    },
    CampaignUpdated {
        campaign_id: EntityId,
        before_status: String,
        after_status: String,
        at: DateTime<Utc>,
    },

    // ── Account state events ───────────────────────
    AccountStateChanged {
        customer_id: EntityId,
        previous_state: String,
        new_state: String,
        reason: String,
        manual_override: bool,
        at: DateTime<Utc>,
    },

    // ── Security events ────────────────────────────
    AccessDeniedAttempt {
        actor: String,
        action: String,
        at: DateTime<Utc>,
    },

    // ── Analytics events ───────────────────────────
    DailyMetricsGenerated {
        date: NaiveDate,
        rows: usize,
        at: DateTime<Utc>,
    },
}

impl RecoveryEvent {
    /// Stable string name for the event_type column in audit_log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::FailureRecorded { .. } => "failure_recorded",
            Self::RetryAttempted { .. } => "retry_attempted",
            Self::RetryRescheduled { .. } => "retry_rescheduled",
            Self::FailureResolved { .. } => "failure_resolved",
            Self::FailureEscalated { .. } => "failure_escalated",
            Self::FailureAbandoned { .. } => "failure_abandoned",
            Self::CampaignCreated { .. } => "campaign_created",
            Self::CampaignStepSent { .. } => "campaign_step_sent",
            Self::CampaignStepRescheduled { .. } => "campaign_step_rescheduled",
            Self::CampaignCompleted { .. } => "campaign_completed",
            Self::CampaignCanceled { .. } => "campaign_canceled",
            Self::CampaignUpdated { .. } => "campaign_updated",
            Self::AccountStateChanged { .. } => "account_state_changed",
            Self::AccessDeniedAttempt { .. } => "access_denied",
            Self::DailyMetricsGenerated { .. } => "daily_metrics_generated",
        }
    }
}

/// The audit trail entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Option<i64>,
    pub actor: String,
    pub subsystem: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized RecoveryEvent
    pub occurred_at: DateTime<Utc>,
}
