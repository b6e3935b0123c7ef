//! Account access state machine.
//!
//! States: active, grace_period, restricted, suspended, reactivated.
//! Escalation walks one edge per recalculation pass
//! (active → grace_period → restricted → suspended), so restrictions are
//! never applied without the customer having been in a grace period
//! first; restorations jump straight back (any state → active,
//! suspended → reactivated). A manual override freezes automatic
//! recalculation until it is explicitly cleared.
//!
//! RULE: "current state" is append-only history. The authoritative row
//! per customer is the one with the greatest updated_at; nothing is
//! updated in place. Recalculation derives the target from the live set
//! of unresolved failures and campaigns, never from an incremental
//! delta, which keeps it correct under out-of-order and duplicate
//! event delivery.

use crate::{
    caller::Caller,
    config::{AccountPolicyConfig, RecoveryConfig, SuspensionPolicy},
    dunning_engine::CampaignStatus,
    error::{RecoveryError, RecoveryResult},
    event::RecoveryEvent,
    failure_tracker::{FailureStatus, PaymentFailure},
    store::RecoveryStore,
    sweep::SweepTask,
    types::{require_id, EntityId},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const SUBSYSTEM: &str = "account_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStateKind {
    Active,
    GracePeriod,
    Restricted,
    Suspended,
    Reactivated,
}

impl AccountStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::GracePeriod => "grace_period",
            Self::Restricted => "restricted",
            Self::Suspended => "suspended",
            Self::Reactivated => "reactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "grace_period" => Some(Self::GracePeriod),
            "restricted" => Some(Self::Restricted),
            "suspended" => Some(Self::Suspended),
            "reactivated" => Some(Self::Reactivated),
            _ => None,
        }
    }

    /// Position on the escalation ladder. Reactivated accounts sit at
    /// the same rung as active ones.
    fn rank(&self) -> u8 {
        match self {
            Self::Active | Self::Reactivated => 0,
            Self::GracePeriod => 1,
            Self::Restricted => 2,
            Self::Suspended => 3,
        }
    }

    pub fn in_good_standing(&self) -> bool {
        matches!(self, Self::Active | Self::Reactivated)
    }
}

/// The transitions the machine performs on its own. Admin writes with
/// manual_override bypass this graph.
pub fn is_valid_transition(from: AccountStateKind, to: AccountStateKind) -> bool {
    use AccountStateKind::*;
    matches!(
        (from, to),
        (Active | Reactivated, GracePeriod)
            | (GracePeriod, Restricted)
            | (GracePeriod, Active)
            | (Restricted, Suspended)
            | (Restricted, Active)
            | (Suspended, Reactivated)
            | (Suspended, Active)
            | (Reactivated, Active)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub id: Option<i64>,
    pub customer_id: EntityId,
    pub state: AccountStateKind,
    pub reason: String,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub suspension_date: Option<DateTime<Utc>>,
    pub reactivation_date: Option<DateTime<Utc>>,
    pub feature_restrictions: Vec<String>,
    pub manual_override: bool,
    pub override_reason: Option<String>,
    pub override_by: Option<String>,
    pub previous_state: Option<AccountStateKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FeatureAccess {
    pub account_state: AccountStateKind,
    pub restrictions: Vec<String>,
    pub allowed_features: Vec<String>,
    pub grace_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UpdateAccountStateRequest {
    /// Id of the row being superseded; must still be the latest.
    pub account_state_id: i64,
    pub state: AccountStateKind,
    pub reason: String,
    pub manual_override: Option<bool>,
    pub override_reason: Option<String>,
}

pub struct AccountStateMachine {
    store: RecoveryStore,
    config: RecoveryConfig,
}

impl AccountStateMachine {
    pub fn new(store: RecoveryStore, config: RecoveryConfig) -> Self {
        Self { store, config }
    }

    /// The authoritative state row. Customers with no billing history
    /// yet are active; the row is materialized on first transition, not
    /// on read.
    pub fn get_account_state(
        &self,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> RecoveryResult<AccountState> {
        require_id("customer_id", customer_id)?;
        match self.store.latest_account_state(customer_id)? {
            Some(row) => Ok(row),
            None => Ok(default_state(customer_id, now)),
        }
    }

    pub fn get_feature_restrictions(
        &self,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> RecoveryResult<FeatureAccess> {
        let state = self.get_account_state(customer_id, now)?;
        let allowed = self
            .config
            .account
            .master_features
            .iter()
            .filter(|f| !state.feature_restrictions.contains(f))
            .cloned()
            .collect();
        Ok(FeatureAccess {
            account_state: state.state,
            restrictions: state.feature_restrictions,
            allowed_features: allowed,
            grace_period_end: state.grace_period_end,
        })
    }

    /// Admin-only direct write. Transitions outside the graph require
    /// manual_override with a reason; the override freezes automatic
    /// recalculation until another admin write clears it.
    pub fn update_account_state(
        &self,
        request: UpdateAccountStateRequest,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<AccountState> {
        if let Err(denied) = caller.require_admin("update account state") {
            self.store.record_access_denied(
                &caller.actor_id,
                SUBSYSTEM,
                "update account state",
                now,
            )?;
            return Err(denied);
        }

        let current = self.store.account_state_by_id(request.account_state_id)?;
        let latest = self
            .store
            .latest_account_state(&current.customer_id)?
            .unwrap_or_else(|| current.clone());
        if latest.id != current.id {
            return Err(RecoveryError::InvalidState {
                entity: "account state",
                id: request.account_state_id.to_string(),
                detail: "superseded by a newer row, reload the current state".to_string(),
            });
        }

        let override_requested = request.manual_override.unwrap_or(false);
        if override_requested
            && request
                .override_reason
                .as_deref()
                .map_or(true, |r| r.trim().is_empty())
        {
            return Err(RecoveryError::Validation(
                "override_reason is required when manual_override is set".to_string(),
            ));
        }
        if request.state == current.state && override_requested == current.manual_override {
            return Err(RecoveryError::InvalidState {
                entity: "account state",
                id: request.account_state_id.to_string(),
                detail: format!("already {}", current.state.as_str()),
            });
        }
        if request.state != current.state
            && !override_requested
            && !is_valid_transition(current.state, request.state)
        {
            return Err(RecoveryError::InvalidState {
                entity: "account state",
                id: request.account_state_id.to_string(),
                detail: format!(
                    "transition {} → {} is outside the graph (manual_override required)",
                    current.state.as_str(),
                    request.state.as_str()
                ),
            });
        }

        let mut row = AccountState {
            id: None,
            customer_id: current.customer_id.clone(),
            state: request.state,
            reason: request.reason,
            grace_period_end: if matches!(
                request.state,
                AccountStateKind::GracePeriod | AccountStateKind::Restricted
            ) {
                current.grace_period_end
            } else {
                None
            },
            suspension_date: (request.state == AccountStateKind::Suspended).then_some(now),
            reactivation_date: (request.state.in_good_standing()
                && !current.state.in_good_standing())
            .then_some(now),
            feature_restrictions: restrictions_for(&self.config.account, request.state),
            manual_override: override_requested,
            override_reason: request.override_reason,
            override_by: override_requested.then(|| caller.actor_id.clone()),
            previous_state: Some(current.state),
            created_at: now,
            updated_at: now,
        };
        let id = self.store.append_account_state(&row)?;
        row.id = Some(id);

        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::AccountStateChanged {
                customer_id: row.customer_id.clone(),
                previous_state: current.state.as_str().to_string(),
                new_state: row.state.as_str().to_string(),
                reason: row.reason.clone(),
                manual_override: override_requested,
                at: now,
            },
            now,
        )?;
        Ok(row)
    }
}

impl SweepTask for AccountStateMachine {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> RecoveryResult<Vec<RecoveryEvent>> {
        let mut customers: BTreeSet<String> = self
            .store
            .customers_with_unresolved_failures()?
            .into_iter()
            .collect();
        customers.extend(self.store.customers_with_account_history()?);

        let mut events = Vec::new();
        for customer_id in customers {
            if let Some(event) =
                recalculate_customer(&self.store, &self.config, &customer_id, "system", now)?
            {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Derive the customer's state from the live failure/campaign set and
/// append a history row when it changed. The shared entry point for the
/// sweep and for cascades out of the failure tracker.
pub(crate) fn recalculate_customer(
    store: &RecoveryStore,
    config: &RecoveryConfig,
    customer_id: &str,
    actor: &str,
    now: DateTime<Utc>,
) -> RecoveryResult<Option<RecoveryEvent>> {
    let current = store.latest_account_state(customer_id)?;
    let (current_kind, frozen) = match &current {
        Some(row) => (row.state, row.manual_override),
        None => (AccountStateKind::Active, false),
    };
    if frozen {
        return Ok(None);
    }

    let unresolved = store.unresolved_failures_for_customer(customer_id)?;
    let target = derive_target(store, &config.account, current_kind, &unresolved, now)?;
    let next = step_toward(current_kind, target);
    if next == current_kind {
        return Ok(None);
    }
    if current.is_none() && next.in_good_standing() {
        // Nothing on file and nothing to restrict.
        return Ok(None);
    }

    let grace_period_end = unresolved.first().map(|oldest| {
        oldest.created_at
            + Duration::hours(config.account.grace_threshold_hours)
            + Duration::days(config.account.grace_period_days)
    });
    let row = AccountState {
        id: None,
        customer_id: customer_id.to_string(),
        state: next,
        reason: reason_for(next, &unresolved),
        grace_period_end: matches!(
            next,
            AccountStateKind::GracePeriod | AccountStateKind::Restricted
        )
        .then_some(grace_period_end)
        .flatten(),
        suspension_date: (next == AccountStateKind::Suspended).then_some(now),
        reactivation_date: (next.in_good_standing() && !current_kind.in_good_standing())
            .then_some(now),
        feature_restrictions: restrictions_for(&config.account, next),
        manual_override: false,
        override_reason: None,
        override_by: None,
        previous_state: Some(current_kind),
        created_at: now,
        updated_at: now,
    };
    store.append_account_state(&row)?;

    let event = RecoveryEvent::AccountStateChanged {
        customer_id: customer_id.to_string(),
        previous_state: current_kind.as_str().to_string(),
        new_state: next.as_str().to_string(),
        reason: row.reason.clone(),
        manual_override: false,
        at: now,
    };
    store.append_audit(actor, SUBSYSTEM, &event, now)?;
    log::info!(
        "account {customer_id}: {} → {}",
        current_kind.as_str(),
        next.as_str()
    );
    Ok(Some(event))
}

fn derive_target(
    store: &RecoveryStore,
    policy: &AccountPolicyConfig,
    current: AccountStateKind,
    unresolved: &[PaymentFailure],
    now: DateTime<Utc>,
) -> RecoveryResult<AccountStateKind> {
    use AccountStateKind::*;

    if unresolved.is_empty() {
        return Ok(match current {
            Suspended | Reactivated => Reactivated,
            _ => Active,
        });
    }
    // Abandonment keeps the account suspended until an admin steps in.
    if unresolved
        .iter()
        .any(|f| f.status == FailureStatus::Abandoned)
    {
        return Ok(Suspended);
    }

    let oldest = &unresolved[0];
    let age = now - oldest.created_at;
    if age < Duration::hours(policy.grace_threshold_hours) {
        // All remaining failures are fresh; a clean slate otherwise.
        return Ok(match current {
            Suspended | Reactivated => Reactivated,
            _ => Active,
        });
    }

    let grace_end = oldest.created_at
        + Duration::hours(policy.grace_threshold_hours)
        + Duration::days(policy.grace_period_days);
    if now < grace_end {
        return Ok(GracePeriod);
    }
    if suspension_policy_met(store, policy, unresolved, now)? {
        Ok(Suspended)
    } else {
        Ok(Restricted)
    }
}

fn suspension_policy_met(
    store: &RecoveryStore,
    policy: &AccountPolicyConfig,
    unresolved: &[PaymentFailure],
    now: DateTime<Utc>,
) -> RecoveryResult<bool> {
    match &policy.suspension {
        SuspensionPolicy::CampaignExhausted => {
            for failure in unresolved {
                if let Some(campaign) = store.campaign_for_failure(&failure.failure_id)? {
                    if campaign.status == CampaignStatus::Completed {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        SuspensionPolicy::FailureCountAtLeast { count } => {
            Ok(unresolved.len() as u32 >= *count)
        }
        SuspensionPolicy::OpenFailureOlderThanDays { days } => Ok(unresolved
            .iter()
            .any(|f| now - f.created_at >= Duration::days(*days))),
    }
}

/// Escalations advance one rung per pass, so restrictions never land on
/// an account that was active a moment ago without a grace period in
/// between. Restorations jump directly.
fn step_toward(current: AccountStateKind, target: AccountStateKind) -> AccountStateKind {
    use AccountStateKind::*;
    if target.rank() <= current.rank() {
        return target;
    }
    match current {
        Active | Reactivated => GracePeriod,
        GracePeriod => Restricted,
        Restricted => Suspended,
        Suspended => Suspended,
    }
}

fn restrictions_for(policy: &AccountPolicyConfig, state: AccountStateKind) -> Vec<String> {
    match state {
        AccountStateKind::Restricted => policy.restricted_features.clone(),
        AccountStateKind::Suspended => policy.master_features.clone(),
        _ => Vec::new(),
    }
}

fn reason_for(state: AccountStateKind, unresolved: &[PaymentFailure]) -> String {
    match state {
        AccountStateKind::GracePeriod => {
            "payment failure unresolved past grace threshold".to_string()
        }
        AccountStateKind::Restricted => "grace period expired without resolution".to_string(),
        AccountStateKind::Suspended => {
            if unresolved
                .iter()
                .any(|f| f.status == FailureStatus::Abandoned)
            {
                "payment failure abandoned".to_string()
            } else {
                "suspension policy met without resolution".to_string()
            }
        }
        AccountStateKind::Active | AccountStateKind::Reactivated => {
            "all payment failures resolved".to_string()
        }
    }
}

fn default_state(customer_id: &str, now: DateTime<Utc>) -> AccountState {
    AccountState {
        id: None,
        customer_id: customer_id.to_string(),
        state: AccountStateKind::Active,
        reason: "no billing issues on file".to_string(),
        grace_period_end: None,
        suspension_date: None,
        reactivation_date: None,
        feature_restrictions: Vec::new(),
        manual_override: false,
        override_reason: None,
        override_by: None,
        previous_state: None,
        created_at: now,
        updated_at: now,
    }
}
