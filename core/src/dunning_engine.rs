//! Dunning campaign engine.
//!
//! Sequences the escalating customer outreach tied to an open payment
//! failure. Campaign shape comes from an immutable template per
//! campaign type (total steps, step offsets from campaign start,
//! default channels); progress lives entirely in the store.
//!
//!   active → completed   (sequence exhausted, or failure resolved)
//!   active → canceled    (failure abandoned, or admin cancel)
//!   active ⇄ paused      (admin)
//!
//! The linked failure is re-checked at the moment a step executes, not
//! when it was scheduled, so a resolution or cancellation always beats
//! a due communication.

use crate::{
    account_state,
    caller::Caller,
    config::{CampaignTemplate, RecoveryConfig},
    error::{RecoveryError, RecoveryResult},
    event::RecoveryEvent,
    failure_tracker::FailureStatus,
    notifier::Notifier,
    rng::EntityRng,
    store::RecoveryStore,
    sweep::SweepTask,
    types::{require_id, EntityId},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SUBSYSTEM: &str = "dunning_engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
    Completed,
    Canceled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStepStatus {
    Scheduled,
    Sent,
    RetryScheduled,
}

impl CampaignStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::RetryScheduled => "retry_scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "sent" => Some(Self::Sent),
            "retry_scheduled" => Some(Self::RetryScheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningCampaign {
    pub campaign_id: EntityId,
    pub customer_id: EntityId,
    pub payment_failure_id: EntityId,
    pub campaign_type: String,
    pub customer_segment: String,
    pub sequence_step: u32,
    pub total_steps: u32,
    pub status: CampaignStatus,
    pub current_step_status: CampaignStepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_communication_at: Option<DateTime<Utc>>,
    pub last_communication_at: Option<DateTime<Utc>>,
    pub communication_channels: Vec<String>,
    pub ab_test_group: String,
    pub personalization: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One dispatched send. Engagement receipts flip `opened` later.
#[derive(Debug, Clone)]
pub struct CampaignCommunication {
    pub communication_id: EntityId,
    pub campaign_id: EntityId,
    pub sequence_step: u32,
    pub channel: String,
    pub template: String,
    pub receipt_id: String,
    pub sent_at: DateTime<Utc>,
    pub opened: bool,
}

#[derive(Debug, Clone)]
pub struct CreateCampaignParams {
    pub customer_id: EntityId,
    pub payment_failure_id: EntityId,
    pub campaign_type: String,
    pub communication_channels: Option<Vec<String>>,
    pub customer_segment: Option<String>,
    pub personalization: Option<serde_json::Value>,
    pub ab_test_group: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct UpdateCampaignRequest {
    pub campaign_id: EntityId,
    pub status: Option<CampaignStatus>,
    pub communication_channels: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct CampaignFilter {
    pub customer_id: Option<EntityId>,
    pub payment_failure_id: Option<EntityId>,
    pub status: Option<CampaignStatus>,
    pub limit: Option<u32>,
}

pub struct DunningEngine {
    store: RecoveryStore,
    config: RecoveryConfig,
    notifier: Box<dyn Notifier>,
}

impl DunningEngine {
    pub fn new(store: RecoveryStore, config: RecoveryConfig, notifier: Box<dyn Notifier>) -> Self {
        Self {
            store,
            config,
            notifier,
        }
    }

    /// Open a campaign for a failure. Exactly one campaign per failure;
    /// a second create is an InvalidState no-op against the existing one.
    pub fn create_campaign(
        &self,
        params: CreateCampaignParams,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<DunningCampaign> {
        require_id("customer_id", &params.customer_id)?;
        require_id("payment_failure_id", &params.payment_failure_id)?;
        require_id("campaign_type", &params.campaign_type)?;
        let template = self
            .config
            .campaign_templates
            .get(&params.campaign_type)
            .ok_or_else(|| {
                RecoveryError::Validation(format!(
                    "unknown campaign type '{}'",
                    params.campaign_type
                ))
            })?;

        let failure = self.store.get_failure(&params.payment_failure_id)?;
        if failure.customer_id != params.customer_id {
            return Err(RecoveryError::Validation(format!(
                "payment failure '{}' does not belong to customer '{}'",
                params.payment_failure_id, params.customer_id
            )));
        }
        if let Err(denied) =
            caller.require_owner_or_admin(&params.customer_id, "create dunning campaign")
        {
            self.store.record_access_denied(
                &caller.actor_id,
                SUBSYSTEM,
                "create dunning campaign",
                now,
            )?;
            return Err(denied);
        }
        if failure.status.is_terminal() {
            return Err(RecoveryError::InvalidState {
                entity: "payment failure",
                id: failure.failure_id.clone(),
                detail: format!(
                    "cannot open a campaign for a {} failure",
                    failure.status.as_str()
                ),
            });
        }
        if let Some(existing) = self.store.campaign_for_failure(&failure.failure_id)? {
            return Err(RecoveryError::InvalidState {
                entity: "dunning campaign",
                id: existing.campaign_id,
                detail: format!(
                    "a campaign already exists for failure '{}'",
                    failure.failure_id
                ),
            });
        }

        let channels = match params.communication_channels {
            Some(channels) if channels.is_empty() => {
                return Err(RecoveryError::Validation(
                    "communication_channels must not be empty".to_string(),
                ))
            }
            Some(channels) => channels,
            None => template.default_channels.clone(),
        };
        let ab_test_group = params
            .ab_test_group
            .unwrap_or_else(|| assign_ab_group(template, &params.customer_id));

        let campaign = DunningCampaign {
            campaign_id: format!("dc-{}", Uuid::new_v4()),
            customer_id: params.customer_id,
            payment_failure_id: failure.failure_id.clone(),
            campaign_type: template.campaign_type.clone(),
            customer_segment: params
                .customer_segment
                .unwrap_or_else(|| "general".to_string()),
            sequence_step: 1,
            total_steps: template.total_steps,
            status: CampaignStatus::Active,
            current_step_status: CampaignStepStatus::Scheduled,
            started_at: now,
            completed_at: None,
            next_communication_at: Some(now + Duration::hours(template.step_offset_hours[0])),
            last_communication_at: None,
            communication_channels: channels,
            ab_test_group,
            personalization: params.personalization.unwrap_or(serde_json::Value::Null),
            metadata: params
                .metadata
                .unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_campaign(&campaign)?;

        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::CampaignCreated {
                campaign_id: campaign.campaign_id.clone(),
                customer_id: campaign.customer_id.clone(),
                payment_failure_id: campaign.payment_failure_id.clone(),
                campaign_type: campaign.campaign_type.clone(),
                total_steps: campaign.total_steps,
                ab_test_group: campaign.ab_test_group.clone(),
                at: now,
            },
            now,
        )?;
        log::info!(
            "campaign {} opened for failure {} ({}, {} steps, group {})",
            campaign.campaign_id,
            campaign.payment_failure_id,
            campaign.campaign_type,
            campaign.total_steps,
            campaign.ab_test_group
        );
        Ok(campaign)
    }

    /// Execute the current step: re-check the linked failure, dispatch
    /// on every configured channel, then advance or complete.
    pub fn advance_step(
        &mut self,
        campaign_id: &str,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<DunningCampaign> {
        let (campaign, _) = self.execute_step(campaign_id, caller, now)?;
        Ok(campaign)
    }

    fn execute_step(
        &mut self,
        campaign_id: &str,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<(DunningCampaign, Vec<RecoveryEvent>)> {
        require_id("campaign_id", campaign_id)?;
        let campaign = self.store.get_campaign(campaign_id)?;

        if let Err(denied) = caller.require_admin("advance dunning campaign") {
            self.store.record_access_denied(
                &caller.actor_id,
                SUBSYSTEM,
                "advance dunning campaign",
                now,
            )?;
            return Err(denied);
        }
        if campaign.status.is_terminal() {
            return Err(invalid_state(
                &campaign,
                format!("already {}", campaign.status.as_str()),
            ));
        }
        if campaign.status == CampaignStatus::Paused {
            return Err(invalid_state(&campaign, "paused"));
        }

        // Execution-time termination check: the newest failure state
        // wins over a step that was scheduled before it changed.
        let failure = self.store.get_failure(&campaign.payment_failure_id)?;
        if failure.status.is_terminal() {
            let event =
                terminate_for_failure(&self.store, &failure.failure_id, failure.status, &caller.actor_id, now)?;
            let refreshed = self.store.get_campaign(campaign_id)?;
            return Ok((refreshed, event.into_iter().collect()));
        }

        if !self
            .store
            .claim_campaign_step(campaign_id, campaign.sequence_step, now)?
        {
            return Err(invalid_state(
                &campaign,
                "step claimed by a concurrent worker",
            ));
        }

        let mut events = Vec::new();
        let sent_channels = self.dispatch_step(&campaign, now)?;
        if sent_channels.is_empty() {
            // Transport exhausted on every channel: keep the step and
            // come back after the configured delay.
            let retry_at =
                now + Duration::minutes(self.config.dunning.communication_retry_minutes);
            self.store
                .reschedule_campaign_step(campaign_id, retry_at, now)?;
            let event = RecoveryEvent::CampaignStepRescheduled {
                campaign_id: campaign.campaign_id.clone(),
                sequence_step: campaign.sequence_step,
                next_communication_at: retry_at,
                at: now,
            };
            self.store
                .append_audit(&caller.actor_id, SUBSYSTEM, &event, now)?;
            events.push(event);
            return Ok((self.store.get_campaign(campaign_id)?, events));
        }

        let event = RecoveryEvent::CampaignStepSent {
            campaign_id: campaign.campaign_id.clone(),
            sequence_step: campaign.sequence_step,
            channels: sent_channels,
            at: now,
        };
        self.store
            .append_audit(&caller.actor_id, SUBSYSTEM, &event, now)?;
        events.push(event);

        if campaign.sequence_step >= campaign.total_steps {
            self.store.mark_campaign_final_step_sent(campaign_id, now)?;
            self.store
                .finish_campaign(campaign_id, CampaignStatus::Completed, now)?;
            let done = RecoveryEvent::CampaignCompleted {
                campaign_id: campaign.campaign_id.clone(),
                reason: "sequence_exhausted".to_string(),
                at: now,
            };
            self.store
                .append_audit(&caller.actor_id, SUBSYSTEM, &done, now)?;
            log::info!(
                "campaign {} exhausted after {} steps",
                campaign.campaign_id,
                campaign.total_steps
            );
            events.push(done);
            // Exhaustion without resolution feeds the suspension policy.
            if let Some(event) = account_state::recalculate_customer(
                &self.store,
                &self.config,
                &campaign.customer_id,
                &caller.actor_id,
                now,
            )? {
                events.push(event);
            }
        } else {
            let template = self.template_for(&campaign)?;
            let next_step = campaign.sequence_step + 1;
            let offset = template.step_offset_hours[(next_step - 1) as usize];
            let next_at = campaign.started_at + Duration::hours(offset);
            self.store
                .advance_campaign_step(campaign_id, next_step, next_at, now)?;
        }

        Ok((self.store.get_campaign(campaign_id)?, events))
    }

    /// Admin-only campaign edit. Metadata is merged key-wise, never
    /// replaced wholesale.
    pub fn update_campaign(
        &self,
        request: UpdateCampaignRequest,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<DunningCampaign> {
        require_id("campaign_id", &request.campaign_id)?;
        if let Err(denied) = caller.require_admin("update dunning campaign") {
            self.store.record_access_denied(
                &caller.actor_id,
                SUBSYSTEM,
                "update dunning campaign",
                now,
            )?;
            return Err(denied);
        }

        let mut campaign = self.store.get_campaign(&request.campaign_id)?;
        if campaign.status.is_terminal() {
            return Err(invalid_state(
                &campaign,
                format!("already {}", campaign.status.as_str()),
            ));
        }
        let before_status = campaign.status;

        if let Some(new_status) = request.status {
            let allowed = matches!(
                (campaign.status, new_status),
                (CampaignStatus::Active, CampaignStatus::Paused)
                    | (CampaignStatus::Paused, CampaignStatus::Active)
                    | (CampaignStatus::Active, CampaignStatus::Canceled)
                    | (CampaignStatus::Paused, CampaignStatus::Canceled)
            );
            if !allowed && new_status != campaign.status {
                return Err(invalid_state(
                    &campaign,
                    format!(
                        "transition {} → {} not allowed",
                        campaign.status.as_str(),
                        new_status.as_str()
                    ),
                ));
            }
            campaign.status = new_status;
            if new_status == CampaignStatus::Canceled {
                campaign.completed_at = Some(now);
                campaign.next_communication_at = None;
            }
        }
        if let Some(channels) = request.communication_channels {
            if channels.is_empty() {
                return Err(RecoveryError::Validation(
                    "communication_channels must not be empty".to_string(),
                ));
            }
            campaign.communication_channels = channels;
        }
        if let Some(patch) = request.metadata {
            campaign.metadata = merge_metadata(&campaign.metadata, &patch);
        }
        campaign.updated_at = now;
        self.store.update_campaign_row(&campaign)?;

        let event = RecoveryEvent::CampaignUpdated {
            campaign_id: campaign.campaign_id.clone(),
            before_status: before_status.as_str().to_string(),
            after_status: campaign.status.as_str().to_string(),
            at: now,
        };
        self.store
            .append_audit(&caller.actor_id, SUBSYSTEM, &event, now)?;
        if campaign.status == CampaignStatus::Canceled {
            self.store.append_audit(
                &caller.actor_id,
                SUBSYSTEM,
                &RecoveryEvent::CampaignCanceled {
                    campaign_id: campaign.campaign_id.clone(),
                    reason: "admin_cancel".to_string(),
                    at: now,
                },
                now,
            )?;
        }
        Ok(campaign)
    }

    /// Asynchronous engagement feedback from the delivery transport.
    pub fn record_engagement(&self, receipt_id: &str, opened: bool) -> RecoveryResult<()> {
        require_id("receipt_id", receipt_id)?;
        if !self.store.mark_communication_opened(receipt_id, opened)? {
            return Err(RecoveryError::NotFound {
                entity: "communication receipt",
                id: receipt_id.to_string(),
            });
        }
        log::debug!("engagement recorded for receipt {receipt_id}: opened={opened}");
        Ok(())
    }

    pub fn list_campaigns(&self, filter: &CampaignFilter) -> RecoveryResult<Vec<DunningCampaign>> {
        self.store.list_campaigns(filter)
    }

    // ── Internal ───────────────────────────────────────────────

    fn template_for(&self, campaign: &DunningCampaign) -> RecoveryResult<&CampaignTemplate> {
        self.config
            .campaign_templates
            .get(&campaign.campaign_type)
            .ok_or_else(|| {
                RecoveryError::Validation(format!(
                    "no template for campaign type '{}'",
                    campaign.campaign_type
                ))
            })
    }

    /// One send per channel; a channel whose transport stays down is
    /// skipped this round. Returns the channels that went out.
    fn dispatch_step(
        &mut self,
        campaign: &DunningCampaign,
        now: DateTime<Utc>,
    ) -> RecoveryResult<Vec<String>> {
        let template_name = format!(
            "{}_step_{}",
            campaign.campaign_type, campaign.sequence_step
        );
        let personalization = serde_json::json!({
            "customer_id": campaign.customer_id,
            "ab_test_group": campaign.ab_test_group,
            "sequence_step": campaign.sequence_step,
            "data": campaign.personalization,
        });

        let mut sent = Vec::new();
        for channel in &campaign.communication_channels {
            match self.send_with_transport_retry(channel, &template_name, &personalization) {
                Some(receipt_id) => {
                    self.store.insert_communication(&CampaignCommunication {
                        communication_id: format!("cm-{}", Uuid::new_v4()),
                        campaign_id: campaign.campaign_id.clone(),
                        sequence_step: campaign.sequence_step,
                        channel: channel.clone(),
                        template: template_name.clone(),
                        receipt_id,
                        sent_at: now,
                        opened: false,
                    })?;
                    sent.push(channel.clone());
                }
                None => {
                    log::warn!(
                        "notifier transport exhausted for campaign {} channel {channel}",
                        campaign.campaign_id
                    );
                }
            }
        }
        Ok(sent)
    }

    fn send_with_transport_retry(
        &mut self,
        channel: &str,
        template: &str,
        personalization: &serde_json::Value,
    ) -> Option<String> {
        let attempts = self.config.retry.transport_attempts.max(1);
        for attempt in 1..=attempts {
            match self.notifier.send(channel, template, personalization) {
                Ok(receipt) => return Some(receipt.receipt_id),
                Err(err) => {
                    log::warn!(
                        "notify transport attempt {attempt}/{attempts} failed on {channel}: {err}"
                    );
                }
            }
        }
        None
    }
}

impl SweepTask for DunningEngine {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> RecoveryResult<Vec<RecoveryEvent>> {
        let mut events = Vec::new();
        let system = Caller::system();

        // Open campaigns for failures that now qualify.
        if let Some(campaign_type) = self.config.dunning.auto_create_campaign_type.clone() {
            let qualifying = self
                .store
                .failures_qualifying_for_campaign(self.config.dunning.campaign_trigger_retry_count)?;
            for failure in qualifying {
                let params = CreateCampaignParams {
                    customer_id: failure.customer_id.clone(),
                    payment_failure_id: failure.failure_id.clone(),
                    campaign_type: campaign_type.clone(),
                    communication_channels: None,
                    customer_segment: None,
                    personalization: None,
                    ab_test_group: None,
                    metadata: None,
                };
                match self.create_campaign(params, &system, now) {
                    Ok(campaign) => events.push(RecoveryEvent::CampaignCreated {
                        campaign_id: campaign.campaign_id,
                        customer_id: campaign.customer_id,
                        payment_failure_id: campaign.payment_failure_id,
                        campaign_type: campaign.campaign_type,
                        total_steps: campaign.total_steps,
                        ab_test_group: campaign.ab_test_group,
                        at: now,
                    }),
                    Err(RecoveryError::InvalidState { detail, .. }) => {
                        log::debug!(
                            "skipping campaign auto-create for {}: {detail}",
                            failure.failure_id
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Execute due steps.
        for due in self.store.due_campaigns(now)? {
            match self.execute_step(&due.campaign_id, &system, now) {
                Ok((_, step_events)) => events.extend(step_events),
                Err(RecoveryError::InvalidState { detail, .. }) => {
                    log::debug!("skipping due step for {}: {detail}", due.campaign_id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Terminate the campaign linked to a failure that reached a terminal
/// state: completed on resolution, canceled on abandonment. Shared by
/// the failure tracker cascade and the execution-time step check.
pub(crate) fn terminate_for_failure(
    store: &RecoveryStore,
    failure_id: &str,
    failure_status: FailureStatus,
    actor: &str,
    now: DateTime<Utc>,
) -> RecoveryResult<Option<RecoveryEvent>> {
    let Some(campaign) = store.campaign_for_failure(failure_id)? else {
        return Ok(None);
    };
    if campaign.status.is_terminal() {
        return Ok(None);
    }
    let (status, event) = match failure_status {
        FailureStatus::Resolved => (
            CampaignStatus::Completed,
            RecoveryEvent::CampaignCompleted {
                campaign_id: campaign.campaign_id.clone(),
                reason: "failure_resolved".to_string(),
                at: now,
            },
        ),
        FailureStatus::Abandoned => (
            CampaignStatus::Canceled,
            RecoveryEvent::CampaignCanceled {
                campaign_id: campaign.campaign_id.clone(),
                reason: "failure_abandoned".to_string(),
                at: now,
            },
        ),
        _ => return Ok(None),
    };
    store.finish_campaign(&campaign.campaign_id, status, now)?;
    store.append_audit(actor, SUBSYSTEM, &event, now)?;
    log::info!(
        "campaign {} {} (failure {})",
        campaign.campaign_id,
        status.as_str(),
        failure_id
    );
    Ok(Some(event))
}

/// Deterministic A/B assignment per (customer, campaign type): the same
/// customer always lands in the same group for a given campaign type.
fn assign_ab_group(template: &CampaignTemplate, customer_id: &str) -> String {
    let key = format!("{customer_id}:{}", template.campaign_type);
    let idx = EntityRng::for_entity("ab_test", &key, 0)
        .next_u64_below(template.ab_test_groups.len() as u64) as usize;
    template.ab_test_groups[idx].clone()
}

/// Key-wise merge: keys absent from the patch survive, patch keys are
/// added or overwritten. Anything that is not an object on both sides
/// falls back to the patch.
fn merge_metadata(existing: &serde_json::Value, patch: &serde_json::Value) -> serde_json::Value {
    match (existing.as_object(), patch.as_object()) {
        (Some(base), Some(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

fn invalid_state(campaign: &DunningCampaign, detail: impl Into<String>) -> RecoveryError {
    RecoveryError::InvalidState {
        entity: "dunning campaign",
        id: campaign.campaign_id.clone(),
        detail: detail.into(),
    }
}
