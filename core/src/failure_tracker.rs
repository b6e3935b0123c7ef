//! Payment failure tracking and retry scheduling.
//!
//! Owns the failed-payment lifecycle:
//!   pending → retrying → resolved | escalated → abandoned
//!
//! pending:   recorded, no retry attempt consumed yet
//! retrying:  at least one attempt consumed, more scheduled
//! escalated: attempts exhausted, admin intervention required
//! resolved / abandoned: terminal
//!
//! Mutual exclusion between concurrent workers is the claim update that
//! flips the row to `retrying` and clears next_retry_at immediately
//! before the charge. At rest, next_retry_at is NULL exactly for
//! resolved and abandoned rows.

use crate::{
    account_state,
    caller::Caller,
    config::RecoveryConfig,
    dunning_engine,
    error::{RecoveryError, RecoveryResult},
    event::RecoveryEvent,
    processor::{ChargeOutcome, ChargeRequest, PaymentProcessor, TransportError},
    rng::EntityRng,
    store::RecoveryStore,
    sweep::SweepTask,
    types::{require_id, EntityId},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SUBSYSTEM: &str = "failure_tracker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Pending,
    Retrying,
    Resolved,
    Escalated,
    Abandoned,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "retrying" => Some(Self::Retrying),
            "resolved" => Some(Self::Resolved),
            "escalated" => Some(Self::Escalated),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    PaymentSucceeded,
    ManuallyResolved,
    Abandoned,
}

impl ResolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "payment_succeeded",
            Self::ManuallyResolved => "manually_resolved",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_succeeded" => Some(Self::PaymentSucceeded),
            "manually_resolved" => Some(Self::ManuallyResolved),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub failure_id: EntityId,
    pub customer_id: EntityId,
    pub subscription_id: Option<EntityId>,
    pub amount: f64,
    pub currency: String,
    pub failure_reason: String,
    pub failure_code: String,
    pub status: FailureStatus,
    pub retry_count: u32,
    pub max_retry_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolution_type: Option<ResolutionType>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A failed-payment event as delivered by the processor webhook feed.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub idempotency_key: String,
    pub customer_id: EntityId,
    pub subscription_id: Option<EntityId>,
    pub amount: f64,
    pub currency: String,
    pub failure_reason: String,
    pub failure_code: String,
}

#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub failure_id: EntityId,
    pub payment_method_id: Option<EntityId>,
    /// Admin-only: run the charge without consuming an attempt.
    pub skip_retry_count: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Charge approved, failure resolved.
    Resolved,
    /// Charge declined or transport exhausted, next attempt scheduled.
    Rescheduled,
    /// Declined and attempts are now exhausted.
    Escalated,
}

impl RetryDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Rescheduled => "rescheduled",
            Self::Escalated => "escalated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub failure: PaymentFailure,
    pub disposition: RetryDisposition,
}

#[derive(Debug, Clone, Default)]
pub struct FailureFilter {
    pub customer_id: Option<EntityId>,
    pub status: Option<FailureStatus>,
    pub limit: Option<u32>,
}

pub struct FailureTracker {
    store: RecoveryStore,
    config: RecoveryConfig,
    processor: Box<dyn PaymentProcessor>,
}

impl FailureTracker {
    pub fn new(
        store: RecoveryStore,
        config: RecoveryConfig,
        processor: Box<dyn PaymentProcessor>,
    ) -> Self {
        Self {
            store,
            config,
            processor,
        }
    }

    /// Record a processor failure event. Duplicate deliveries (same
    /// idempotency key) return the already-recorded failure untouched.
    /// A second event for an open (customer, subscription) pair updates
    /// that failure rather than opening another one.
    pub fn record_failure(
        &self,
        event: FailureEvent,
        now: DateTime<Utc>,
    ) -> RecoveryResult<PaymentFailure> {
        require_id("idempotency_key", &event.idempotency_key)?;
        require_id("customer_id", &event.customer_id)?;
        require_id("currency", &event.currency)?;
        if event.amount <= 0.0 {
            return Err(RecoveryError::Validation(format!(
                "amount must be positive, got {}",
                event.amount
            )));
        }

        if let Some(existing_id) = self.store.processor_event_failure(&event.idempotency_key)? {
            log::debug!(
                "duplicate processor event {} for failure {existing_id}, ignoring",
                event.idempotency_key
            );
            return self.store.get_failure(&existing_id);
        }

        let failure = match self
            .store
            .find_open_failure(&event.customer_id, event.subscription_id.as_deref())?
        {
            Some(mut open) => {
                open.amount = event.amount;
                open.failure_reason = event.failure_reason.clone();
                open.failure_code = event.failure_code.clone();
                open.updated_at = now;
                self.store.update_failure(&open)?;
                open
            }
            None => {
                let failure_id = format!("pf-{}", Uuid::new_v4());
                let fresh = PaymentFailure {
                    next_retry_at: Some(now + self.retry_delay(&failure_id, 0)),
                    failure_id,
                    customer_id: event.customer_id.clone(),
                    subscription_id: event.subscription_id.clone(),
                    amount: event.amount,
                    currency: event.currency.clone(),
                    failure_reason: event.failure_reason.clone(),
                    failure_code: event.failure_code.clone(),
                    status: FailureStatus::Pending,
                    retry_count: 0,
                    max_retry_attempts: self.config.retry.max_retry_attempts,
                    last_retry_at: None,
                    resolution_type: None,
                    resolved_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_failure(&fresh)?;
                fresh
            }
        };

        self.store
            .record_processor_event(&event.idempotency_key, &failure.failure_id, now)?;
        self.store.append_audit(
            "processor",
            SUBSYSTEM,
            &RecoveryEvent::FailureRecorded {
                failure_id: failure.failure_id.clone(),
                customer_id: failure.customer_id.clone(),
                subscription_id: failure.subscription_id.clone(),
                amount: failure.amount,
                currency: failure.currency.clone(),
                failure_code: failure.failure_code.clone(),
                at: now,
            },
            now,
        )?;
        account_state::recalculate_customer(
            &self.store,
            &self.config,
            &failure.customer_id,
            "system",
            now,
        )?;
        Ok(failure)
    }

    /// Execute one retry attempt. Resolved/abandoned failures and rows
    /// claimed by a concurrent worker are InvalidState no-ops; no charge
    /// is issued for them.
    pub fn retry_payment(
        &mut self,
        request: RetryRequest,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<RetryOutcome> {
        require_id("failure_id", &request.failure_id)?;
        let failure = self.store.get_failure(&request.failure_id)?;

        if let Err(denied) = caller.require_owner_or_admin(&failure.customer_id, "retry payment") {
            self.store
                .record_access_denied(&caller.actor_id, SUBSYSTEM, "retry payment", now)?;
            return Err(denied);
        }
        if request.skip_retry_count && !caller.is_privileged() {
            self.store
                .record_access_denied(&caller.actor_id, SUBSYSTEM, "skip retry count", now)?;
            return Err(RecoveryError::AccessDenied {
                actor: caller.actor_id.clone(),
                action: "skip retry count",
            });
        }
        if failure.status.is_terminal() {
            return Err(invalid_state(
                &failure,
                format!("already {}, no charge issued", failure.status.as_str()),
            ));
        }
        if failure.retry_count >= failure.max_retry_attempts && !request.skip_retry_count {
            return Err(invalid_state(
                &failure,
                format!(
                    "retry attempts exhausted ({}/{})",
                    failure.retry_count, failure.max_retry_attempts
                ),
            ));
        }

        // Optimistic claim immediately before the charge. Exactly one
        // caller wins a race; everyone else gets an InvalidState no-op.
        if !self
            .store
            .claim_failure_for_retry(&failure.failure_id, failure.status, now)?
        {
            return Err(invalid_state(
                &failure,
                "state changed concurrently, retry skipped",
            ));
        }

        let attempt = failure.retry_count + 1;
        match self.charge_with_transport_retry(&failure, &request, now) {
            Ok(outcome) if outcome.success => self.settle_approved(&failure, caller, attempt, now),
            Ok(outcome) => {
                let code = outcome
                    .error_code
                    .unwrap_or_else(|| "declined".to_string());
                self.settle_declined(&failure, &request, caller, attempt, &code, now)
            }
            Err(err) => {
                log::warn!(
                    "processor unavailable for {}: {err}, consuming attempt and rescheduling",
                    failure.failure_id
                );
                self.settle_declined(
                    &failure,
                    &request,
                    caller,
                    attempt,
                    "upstream_unavailable",
                    now,
                )
            }
        }
    }

    /// Give up on a failure. Terminal; cancels the linked campaign and
    /// pushes the account toward suspension per policy.
    pub fn abandon_failure(
        &self,
        failure_id: &str,
        reason: &str,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> RecoveryResult<PaymentFailure> {
        require_id("failure_id", failure_id)?;
        let failure = self.store.get_failure(failure_id)?;

        if let Err(denied) = caller.require_admin("abandon failure") {
            self.store
                .record_access_denied(&caller.actor_id, SUBSYSTEM, "abandon failure", now)?;
            return Err(denied);
        }
        if failure.status.is_terminal() {
            return Err(invalid_state(
                &failure,
                format!("already {}", failure.status.as_str()),
            ));
        }

        self.store.abandon_failure(failure_id, now)?;
        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::FailureAbandoned {
                failure_id: failure.failure_id.clone(),
                customer_id: failure.customer_id.clone(),
                previous_status: failure.status.as_str().to_string(),
                reason: reason.to_string(),
                at: now,
            },
            now,
        )?;
        dunning_engine::terminate_for_failure(
            &self.store,
            failure_id,
            FailureStatus::Abandoned,
            &caller.actor_id,
            now,
        )?;
        account_state::recalculate_customer(
            &self.store,
            &self.config,
            &failure.customer_id,
            &caller.actor_id,
            now,
        )?;
        self.store.get_failure(failure_id)
    }

    pub fn list_failures(&self, filter: &FailureFilter) -> RecoveryResult<Vec<PaymentFailure>> {
        self.store.list_failures(filter)
    }

    // ── Internal ───────────────────────────────────────────────

    fn settle_approved(
        &self,
        failure: &PaymentFailure,
        caller: &Caller,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> RecoveryResult<RetryOutcome> {
        self.store
            .resolve_failure(&failure.failure_id, ResolutionType::PaymentSucceeded, now)?;
        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::RetryAttempted {
                failure_id: failure.failure_id.clone(),
                customer_id: failure.customer_id.clone(),
                attempt,
                outcome: "approved".to_string(),
                at: now,
            },
            now,
        )?;
        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::FailureResolved {
                failure_id: failure.failure_id.clone(),
                customer_id: failure.customer_id.clone(),
                previous_status: failure.status.as_str().to_string(),
                resolution_type: ResolutionType::PaymentSucceeded.as_str().to_string(),
                at: now,
            },
            now,
        )?;

        // Cascade: the campaign has nothing left to chase and the
        // customer's access is restored.
        dunning_engine::terminate_for_failure(
            &self.store,
            &failure.failure_id,
            FailureStatus::Resolved,
            &caller.actor_id,
            now,
        )?;
        account_state::recalculate_customer(
            &self.store,
            &self.config,
            &failure.customer_id,
            &caller.actor_id,
            now,
        )?;

        Ok(RetryOutcome {
            failure: self.store.get_failure(&failure.failure_id)?,
            disposition: RetryDisposition::Resolved,
        })
    }

    fn settle_declined(
        &self,
        failure: &PaymentFailure,
        request: &RetryRequest,
        caller: &Caller,
        attempt: u32,
        outcome_code: &str,
        now: DateTime<Utc>,
    ) -> RecoveryResult<RetryOutcome> {
        let consumed = failure.retry_count;
        let new_count = if request.skip_retry_count {
            failure.retry_count
        } else {
            failure.retry_count + 1
        };
        let escalated = new_count >= failure.max_retry_attempts;
        let next_retry_at = now + self.retry_delay(&failure.failure_id, consumed);
        let status = if escalated {
            FailureStatus::Escalated
        } else {
            FailureStatus::Retrying
        };

        self.store.reschedule_failure(
            &failure.failure_id,
            status,
            new_count,
            next_retry_at,
            now,
        )?;
        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::RetryAttempted {
                failure_id: failure.failure_id.clone(),
                customer_id: failure.customer_id.clone(),
                attempt,
                outcome: outcome_code.to_string(),
                at: now,
            },
            now,
        )?;
        self.store.append_audit(
            &caller.actor_id,
            SUBSYSTEM,
            &RecoveryEvent::RetryRescheduled {
                failure_id: failure.failure_id.clone(),
                retry_count: new_count,
                next_retry_at,
                at: now,
            },
            now,
        )?;
        if escalated && failure.status != FailureStatus::Escalated {
            self.store.append_audit(
                &caller.actor_id,
                SUBSYSTEM,
                &RecoveryEvent::FailureEscalated {
                    failure_id: failure.failure_id.clone(),
                    customer_id: failure.customer_id.clone(),
                    retry_count: new_count,
                    at: now,
                },
                now,
            )?;
        }
        account_state::recalculate_customer(
            &self.store,
            &self.config,
            &failure.customer_id,
            &caller.actor_id,
            now,
        )?;

        Ok(RetryOutcome {
            failure: self.store.get_failure(&failure.failure_id)?,
            disposition: if escalated {
                RetryDisposition::Escalated
            } else {
                RetryDisposition::Rescheduled
            },
        })
    }

    fn charge_with_transport_retry(
        &mut self,
        failure: &PaymentFailure,
        request: &RetryRequest,
        now: DateTime<Utc>,
    ) -> Result<ChargeOutcome, TransportError> {
        let charge = ChargeRequest {
            failure_id: failure.failure_id.clone(),
            customer_id: failure.customer_id.clone(),
            payment_method_id: request.payment_method_id.clone(),
            amount: failure.amount,
            currency: failure.currency.clone(),
            idempotency_key: format!(
                "{}-{}-{}",
                failure.failure_id,
                failure.retry_count,
                now.timestamp()
            ),
        };
        let attempts = self.config.retry.transport_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.processor.charge(&charge) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    log::warn!(
                        "charge transport attempt {attempt}/{attempts} failed for {}: {err}",
                        failure.failure_id
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError("no transport attempts made".to_string())))
    }

    /// delay = base × 2^consumed, capped, plus jitter derived from the
    /// failure id and attempt number so every worker agrees on it.
    fn retry_delay(&self, failure_id: &str, consumed_attempts: u32) -> Duration {
        let policy = &self.config.retry;
        let exponent = consumed_attempts.min(31);
        let unjittered = policy.base_delay_minutes.saturating_mul(1_i64 << exponent);
        let capped = unjittered.min(policy.max_delay_minutes);
        let jitter_window_secs = policy.jitter_max_minutes.max(0) * 60;
        let jitter_secs = if jitter_window_secs == 0 {
            0
        } else {
            EntityRng::for_entity("retry_backoff", failure_id, u64::from(consumed_attempts))
                .next_u64_below(jitter_window_secs as u64 + 1) as i64
        };
        Duration::minutes(capped) + Duration::seconds(jitter_secs)
    }
}

impl SweepTask for FailureTracker {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> RecoveryResult<Vec<RecoveryEvent>> {
        let mut events = Vec::new();
        let system = Caller::system();
        for due in self.store.due_retries(now)? {
            let request = RetryRequest {
                failure_id: due.failure_id.clone(),
                payment_method_id: None,
                skip_retry_count: false,
            };
            match self.retry_payment(request, &system, now) {
                Ok(outcome) => events.push(RecoveryEvent::RetryAttempted {
                    failure_id: due.failure_id,
                    customer_id: due.customer_id,
                    attempt: due.retry_count + 1,
                    outcome: outcome.disposition.as_str().to_string(),
                    at: now,
                }),
                Err(RecoveryError::InvalidState { detail, .. }) => {
                    // Raced with a concurrent worker or a fresher state.
                    log::debug!("skipping due retry for {}: {detail}", due.failure_id);
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

fn invalid_state(failure: &PaymentFailure, detail: impl Into<String>) -> RecoveryError {
    RecoveryError::InvalidState {
        entity: "payment failure",
        id: failure.failure_id.clone(),
        detail: detail.into(),
    }
}
