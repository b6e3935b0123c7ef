//! Payment failure lifecycle and retry scheduling tests.

use chrono::Duration;
use recovery_core::{
    caller::Caller,
    dunning_engine::{CampaignFilter, CampaignStatus},
    engine::RecoveryEngine,
    error::RecoveryError,
    failure_tracker::{
        FailureEvent, FailureFilter, FailureStatus, ResolutionType, RetryDisposition, RetryRequest,
    },
    processor::ScriptedCharge,
};

fn renewal_event(key: &str, customer: &str) -> FailureEvent {
    FailureEvent {
        idempotency_key: key.to_string(),
        customer_id: customer.to_string(),
        subscription_id: Some(format!("sub-{customer}")),
        amount: 49.0,
        currency: "USD".to_string(),
        failure_reason: "insufficient funds".to_string(),
        failure_code: "card_declined".to_string(),
    }
}

fn retry(failure_id: &str) -> RetryRequest {
    RetryRequest {
        failure_id: failure_id.to_string(),
        payment_method_id: Some("pm_1".to_string()),
        skip_retry_count: false,
    }
}

#[test]
fn record_failure_opens_pending_failure_with_schedule() {
    let (engine, _) = RecoveryEngine::build_test("pf-record", vec![]).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    assert_eq!(failure.status, FailureStatus::Pending);
    assert_eq!(failure.retry_count, 0);
    assert_eq!(failure.max_retry_attempts, 3);
    let next = failure.next_retry_at.expect("fresh failure must be scheduled");
    assert!(next > engine.now(), "first retry lies in the future");
}

#[test]
fn duplicate_idempotency_key_is_a_no_op() {
    let (engine, _) = RecoveryEngine::build_test("pf-dedupe", vec![]).unwrap();
    let first = engine.record_failure(renewal_event("evt-dup", "c1")).unwrap();
    let second = engine.record_failure(renewal_event("evt-dup", "c1")).unwrap();

    assert_eq!(first.failure_id, second.failure_id);
    assert_eq!(engine.store().failure_count_total().unwrap(), 1);
}

#[test]
fn second_event_for_open_pair_updates_the_existing_failure() {
    let (engine, _) = RecoveryEngine::build_test("pf-increment", vec![]).unwrap();
    let first = engine.record_failure(renewal_event("evt-a", "c1")).unwrap();

    let mut followup = renewal_event("evt-b", "c1");
    followup.amount = 59.0;
    followup.failure_code = "expired_card".to_string();
    let second = engine.record_failure(followup).unwrap();

    assert_eq!(first.failure_id, second.failure_id);
    assert_eq!(second.amount, 59.0);
    assert_eq!(second.failure_code, "expired_card");
    assert_eq!(engine.store().failure_count_total().unwrap(), 1);
}

/// Processor success resolves the failure, completes the linked
/// campaign, and restores the customer's account in one call.
#[test]
fn retry_success_resolves_and_cascades() {
    let (mut engine, _) =
        RecoveryEngine::build_test("pf-resolve", vec![ScriptedCharge::Approve]).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let campaign = engine
        .create_campaign(
            recovery_core::dunning_engine::CreateCampaignParams {
                customer_id: "c1".to_string(),
                payment_failure_id: failure.failure_id.clone(),
                campaign_type: "standard".to_string(),
                communication_channels: Some(vec!["email".to_string()]),
                customer_segment: None,
                personalization: None,
                ab_test_group: None,
                metadata: None,
            },
            &Caller::admin("admin-1"),
        )
        .unwrap();

    let outcome = engine
        .retry_payment(retry(&failure.failure_id), &Caller::customer("c1"))
        .unwrap();

    assert_eq!(outcome.disposition, RetryDisposition::Resolved);
    assert_eq!(outcome.failure.status, FailureStatus::Resolved);
    assert_eq!(
        outcome.failure.resolution_type,
        Some(ResolutionType::PaymentSucceeded)
    );
    assert!(outcome.failure.next_retry_at.is_none());

    let campaigns = engine
        .list_campaigns(&CampaignFilter {
            payment_failure_id: Some(failure.failure_id.clone()),
            ..CampaignFilter::default()
        })
        .unwrap();
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].campaign_id, campaign.campaign_id);
    assert_eq!(campaigns[0].status, CampaignStatus::Completed);

    let account = engine.get_account_state("c1").unwrap();
    assert!(account.state.in_good_standing());
}

#[test]
fn declined_retry_reschedules_with_base_backoff() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "pf-decline",
        vec![ScriptedCharge::Decline("card_declined")],
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let outcome = engine
        .retry_payment(retry(&failure.failure_id), &Caller::customer("c1"))
        .unwrap();

    assert_eq!(outcome.disposition, RetryDisposition::Rescheduled);
    assert_eq!(outcome.failure.status, FailureStatus::Retrying);
    assert_eq!(outcome.failure.retry_count, 1);

    // Exponent is the attempts consumed before this one: base × 2^0.
    let delay = outcome.failure.next_retry_at.unwrap() - outcome.failure.last_retry_at.unwrap();
    assert!(delay >= Duration::minutes(60), "delay {delay} below base");
    assert!(
        delay <= Duration::minutes(60) + Duration::minutes(15),
        "delay {delay} beyond base plus jitter"
    );
}

/// With two attempts already consumed, the third failed attempt lands
/// in [base × 2², base × 2² + jitter_max] and escalates the failure.
#[test]
fn backoff_window_and_escalation_at_exhaustion() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "pf-backoff",
        vec![
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
        ],
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let caller = Caller::customer("c1");

    engine.retry_payment(retry(&failure.failure_id), &caller).unwrap();
    engine.retry_payment(retry(&failure.failure_id), &caller).unwrap();
    let outcome = engine
        .retry_payment(retry(&failure.failure_id), &caller)
        .unwrap();

    assert_eq!(outcome.disposition, RetryDisposition::Escalated);
    assert_eq!(outcome.failure.status, FailureStatus::Escalated);
    assert_eq!(outcome.failure.retry_count, 3);

    let delay = outcome.failure.next_retry_at.unwrap() - outcome.failure.last_retry_at.unwrap();
    assert!(delay >= Duration::minutes(240), "delay {delay} below base × 2²");
    assert!(
        delay <= Duration::minutes(240) + Duration::minutes(15),
        "delay {delay} beyond base × 2² plus jitter"
    );
    assert_eq!(engine.store().audit_count("failure_escalated").unwrap(), 1);
}

/// Retrying an already-resolved failure is an InvalidState no-op and
/// never reaches the processor a second time.
#[test]
fn retry_after_resolution_never_charges_twice() {
    let (mut engine, charges) =
        RecoveryEngine::build_test("pf-idempotent", vec![ScriptedCharge::Approve]).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let caller = Caller::customer("c1");

    engine.retry_payment(retry(&failure.failure_id), &caller).unwrap();
    let err = engine
        .retry_payment(retry(&failure.failure_id), &caller)
        .unwrap_err();

    assert!(matches!(err, RecoveryError::InvalidState { .. }));
    assert_eq!(charges.lock().unwrap().len(), 1, "exactly one charge issued");

    let resolved = engine.store().get_failure(&failure.failure_id).unwrap();
    assert_eq!(resolved.status, FailureStatus::Resolved);
    assert!(resolved.next_retry_at.is_none());
}

/// Exhausted failures reject further retries unless an admin explicitly
/// skips the attempt counter.
#[test]
fn exhausted_retries_require_admin_skip() {
    let (mut engine, charges) = RecoveryEngine::build_test(
        "pf-skip",
        vec![
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Approve,
        ],
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let customer = Caller::customer("c1");

    for _ in 0..3 {
        engine.retry_payment(retry(&failure.failure_id), &customer).unwrap();
    }

    // Plain retry on an exhausted failure is rejected.
    let err = engine
        .retry_payment(retry(&failure.failure_id), &customer)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::InvalidState { .. }));

    // skip_retry_count is admin-only.
    let mut skip = retry(&failure.failure_id);
    skip.skip_retry_count = true;
    let err = engine.retry_payment(skip.clone(), &customer).unwrap_err();
    assert!(matches!(err, RecoveryError::AccessDenied { .. }));

    let outcome = engine.retry_payment(skip, &Caller::admin("admin-1")).unwrap();
    assert_eq!(outcome.disposition, RetryDisposition::Resolved);
    assert_eq!(charges.lock().unwrap().len(), 4);
}

/// A processor outage consumes a retry attempt and reschedules instead
/// of surfacing a fatal error.
#[test]
fn transport_exhaustion_consumes_attempt() {
    let (mut engine, charges) = RecoveryEngine::build_test(
        "pf-upstream",
        vec![
            ScriptedCharge::TransportDown,
            ScriptedCharge::TransportDown,
            ScriptedCharge::TransportDown,
        ],
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let outcome = engine
        .retry_payment(retry(&failure.failure_id), &Caller::customer("c1"))
        .unwrap();

    assert_eq!(outcome.disposition, RetryDisposition::Rescheduled);
    assert_eq!(outcome.failure.retry_count, 1);
    assert!(outcome.failure.next_retry_at.is_some());
    // One business attempt, three transport attempts.
    assert_eq!(charges.lock().unwrap().len(), 3);
}

#[test]
fn abandon_is_admin_only_and_terminal() {
    let (engine, _) = RecoveryEngine::build_test("pf-abandon", vec![]).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let err = engine
        .abandon_failure(&failure.failure_id, "unreachable customer", &Caller::customer("c1"))
        .unwrap_err();
    assert!(matches!(err, RecoveryError::AccessDenied { .. }));

    let abandoned = engine
        .abandon_failure(&failure.failure_id, "unreachable customer", &Caller::admin("admin-1"))
        .unwrap();
    assert_eq!(abandoned.status, FailureStatus::Abandoned);
    assert_eq!(abandoned.resolution_type, Some(ResolutionType::Abandoned));
    assert!(abandoned.next_retry_at.is_none());

    let err = engine
        .abandon_failure(&failure.failure_id, "again", &Caller::admin("admin-1"))
        .unwrap_err();
    assert!(matches!(err, RecoveryError::InvalidState { .. }));
}

#[test]
fn non_owner_cannot_retry_and_denial_is_audited() {
    let (mut engine, charges) = RecoveryEngine::build_test("pf-denied", vec![]).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let err = engine
        .retry_payment(retry(&failure.failure_id), &Caller::customer("c2"))
        .unwrap_err();

    assert!(matches!(err, RecoveryError::AccessDenied { .. }));
    assert!(charges.lock().unwrap().is_empty(), "no charge on denial");
    assert_eq!(engine.store().audit_count("access_denied").unwrap(), 1);
}

#[test]
fn malformed_and_unknown_ids_are_rejected_without_mutation() {
    let (mut engine, charges) = RecoveryEngine::build_test("pf-validate", vec![]).unwrap();

    let mut blank = renewal_event("evt-1", "c1");
    blank.customer_id = "  ".to_string();
    assert!(matches!(
        engine.record_failure(blank).unwrap_err(),
        RecoveryError::Validation(_)
    ));

    assert!(matches!(
        engine
            .retry_payment(retry("   "), &Caller::admin("admin-1"))
            .unwrap_err(),
        RecoveryError::Validation(_)
    ));
    assert!(matches!(
        engine
            .retry_payment(retry("pf-missing"), &Caller::admin("admin-1"))
            .unwrap_err(),
        RecoveryError::NotFound { .. }
    ));

    assert_eq!(engine.store().failure_count_total().unwrap(), 0);
    assert!(charges.lock().unwrap().is_empty());
}

#[test]
fn list_failures_filters_by_customer_and_status() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "pf-list",
        vec![ScriptedCharge::Approve],
    )
    .unwrap();
    let f1 = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    engine.record_failure(renewal_event("evt-2", "c2")).unwrap();

    engine
        .retry_payment(retry(&f1.failure_id), &Caller::customer("c1"))
        .unwrap();

    let resolved = engine
        .list_failures(&FailureFilter {
            status: Some(FailureStatus::Resolved),
            ..FailureFilter::default()
        })
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].customer_id, "c1");

    let for_c2 = engine
        .list_failures(&FailureFilter {
            customer_id: Some("c2".to_string()),
            ..FailureFilter::default()
        })
        .unwrap();
    assert_eq!(for_c2.len(), 1);
    assert_eq!(for_c2[0].status, FailureStatus::Pending);
}
