//! Engine sweep tests: persistent scheduling, optimistic claims, and
//! the audit trail.

use chrono::Duration;
use recovery_core::{
    caller::Caller,
    clock::Clock,
    config::RecoveryConfig,
    engine::{test_epoch, RecoveryEngine},
    event::RecoveryEvent,
    failure_tracker::{FailureEvent, FailureStatus},
    notifier::LogNotifier,
    processor::{ScriptedCharge, ScriptedProcessor},
    store::RecoveryStore,
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

#[test]
fn nothing_is_charged_before_the_schedule_is_due() {
    let (mut engine, charges) = RecoveryEngine::build_test("sw-idle", vec![]).unwrap();
    engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let events = engine.run_sweep().unwrap();

    assert!(charges.lock().unwrap().is_empty());
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, RecoveryEvent::RetryAttempted { .. })),
        "no retry fires before next_retry_at"
    );
}

#[test]
fn due_retries_fire_and_are_audited() {
    let (mut engine, charges) = RecoveryEngine::build_test(
        "sw-due",
        vec![ScriptedCharge::Decline("card_declined")],
    )
    .unwrap();
    engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    engine.advance_clock(Duration::hours(2));
    let events = engine.run_sweep().unwrap();

    assert_eq!(charges.lock().unwrap().len(), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, RecoveryEvent::RetryAttempted { .. })));
    assert!(engine.store().audit_count("retry_attempted").unwrap() >= 1);
    assert!(engine.store().audit_count("retry_rescheduled").unwrap() >= 1);
}

/// The schedule lives in the store: a brand-new engine over the same
/// database picks up work scheduled before the "restart".
#[test]
fn restart_picks_up_previously_scheduled_work() {
    let store = RecoveryStore::open_shared_memory("sw-restart").unwrap();
    store.migrate().unwrap();

    {
        let engine = RecoveryEngine::build(
            &store,
            RecoveryConfig::default_test(),
            Clock::fixed(test_epoch()),
            Box::new(ScriptedProcessor::new(vec![])),
            Box::new(LogNotifier),
        )
        .unwrap();
        engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    } // first worker process gone

    let mut engine = RecoveryEngine::build(
        &store,
        RecoveryConfig::default_test(),
        Clock::fixed(test_epoch()),
        Box::new(ScriptedProcessor::new(vec![ScriptedCharge::Approve])),
        Box::new(LogNotifier),
    )
    .unwrap();
    engine.advance_clock(Duration::hours(2));
    engine.run_sweep().unwrap();

    let failures = engine.list_failures(&Default::default()).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].status, FailureStatus::Resolved);
}

/// Two workers race for the same due retry: exactly one claim wins.
#[test]
fn concurrent_claims_are_mutually_exclusive() {
    let store = RecoveryStore::open_shared_memory("sw-claim").unwrap();
    store.migrate().unwrap();
    let engine = RecoveryEngine::build(
        &store,
        RecoveryConfig::default_test(),
        Clock::fixed(test_epoch()),
        Box::new(ScriptedProcessor::new(vec![])),
        Box::new(LogNotifier),
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let worker_a = store.reopen().unwrap();
    let worker_b = store.reopen().unwrap();
    let now = test_epoch() + Duration::hours(2);

    let first = worker_a
        .claim_failure_for_retry(&failure.failure_id, FailureStatus::Pending, now)
        .unwrap();
    let second = worker_b
        .claim_failure_for_retry(&failure.failure_id, FailureStatus::Pending, now)
        .unwrap();

    assert!(first, "first worker claims the row");
    assert!(!second, "second worker sees the claim and backs off");
}

#[test]
fn audit_entries_carry_actor_and_before_after_state() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "sw-audit",
        vec![ScriptedCharge::Approve],
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    engine
        .retry_payment(
            recovery_core::failure_tracker::RetryRequest {
                failure_id: failure.failure_id.clone(),
                payment_method_id: Some("pm_1".to_string()),
                skip_retry_count: false,
            },
            &Caller::customer("c1"),
        )
        .unwrap();

    let entries = engine.store().audit_entries("failure_resolved").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor, "c1");
    assert_eq!(entries[0].subsystem, "failure_tracker");
    assert!(entries[0].payload.contains("\"previous_status\":\"pending\""));
    assert!(entries[0].payload.contains("payment_succeeded"));
}

/// A full pass over a mixed population converges: resolutions restore
/// accounts, exhausted declines escalate, and every mutation is audited.
#[test]
fn mixed_population_converges_under_sweeps() {
    // c-good recovers on the first due retry; c-bad declines forever.
    let (mut engine, _) = RecoveryEngine::build_test(
        "sw-mixed",
        vec![
            ScriptedCharge::Approve,
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
            ScriptedCharge::Decline("card_declined"),
        ],
    )
    .unwrap();
    engine.record_failure(renewal_event("evt-good", "c-good")).unwrap();
    engine.advance_clock(Duration::hours(6));
    engine.run_sweep().unwrap(); // c-good's first due retry approves

    engine.record_failure(renewal_event("evt-bad", "c-bad")).unwrap();
    for _ in 0..39 {
        engine.advance_clock(Duration::hours(6));
        engine.run_sweep().unwrap();
    }

    let good = engine
        .list_failures(&recovery_core::failure_tracker::FailureFilter {
            customer_id: Some("c-good".to_string()),
            ..Default::default()
        })
        .unwrap();
    let bad = engine
        .list_failures(&recovery_core::failure_tracker::FailureFilter {
            customer_id: Some("c-bad".to_string()),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(good[0].status, FailureStatus::Resolved);
    assert!(engine.get_account_state("c-good").unwrap().state.in_good_standing());

    assert_eq!(bad[0].status, FailureStatus::Escalated);
    assert_eq!(bad[0].retry_count, bad[0].max_retry_attempts);
    assert!(
        !engine.get_account_state("c-bad").unwrap().state.in_good_standing(),
        "unresolved decline degrades the account"
    );

    assert!(engine.store().audit_total().unwrap() > 0);
}
