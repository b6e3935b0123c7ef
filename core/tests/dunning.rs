//! Dunning campaign engine tests.

use chrono::Duration;
use recovery_core::{
    caller::Caller,
    clock::Clock,
    config::RecoveryConfig,
    dunning_engine::{
        CampaignFilter, CampaignStatus, CampaignStepStatus, CreateCampaignParams,
        UpdateCampaignRequest,
    },
    engine::{test_epoch, RecoveryEngine},
    error::RecoveryError,
    failure_tracker::{FailureEvent, FailureStatus, ResolutionType},
    notifier::FlakyNotifier,
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

fn campaign_params(customer: &str, failure_id: &str) -> CreateCampaignParams {
    CreateCampaignParams {
        customer_id: customer.to_string(),
        payment_failure_id: failure_id.to_string(),
        campaign_type: "standard".to_string(),
        communication_channels: Some(vec!["email".to_string()]),
        customer_segment: None,
        personalization: None,
        ab_test_group: None,
        metadata: None,
    }
}

fn declines(n: usize) -> Vec<ScriptedCharge> {
    vec![ScriptedCharge::Decline("card_declined"); n]
}

#[test]
fn create_campaign_follows_the_template() {
    let (engine, _) = RecoveryEngine::build_test("dn-create", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &Caller::admin("admin-1"))
        .unwrap();

    assert_eq!(campaign.total_steps, 5);
    assert_eq!(campaign.sequence_step, 1);
    assert_eq!(campaign.status, CampaignStatus::Active);
    assert_eq!(campaign.current_step_status, CampaignStepStatus::Scheduled);
    assert_eq!(campaign.communication_channels, vec!["email".to_string()]);
    // First step offset is zero hours: due at creation time.
    assert_eq!(campaign.next_communication_at, Some(engine.now()));
    assert!(
        ["control", "variant_a"].contains(&campaign.ab_test_group.as_str()),
        "group {} not in template",
        campaign.ab_test_group
    );
}

/// The same (customer, campaign type) pair always lands in the same
/// A/B group, whichever worker assigns it.
#[test]
fn ab_assignment_is_deterministic_per_customer() {
    let (engine, _) = RecoveryEngine::build_test("dn-ab", declines(8)).unwrap();

    let mut event = renewal_event("evt-1", "c1");
    event.subscription_id = Some("sub-a".to_string());
    let f1 = engine.record_failure(event).unwrap();
    let mut event = renewal_event("evt-2", "c1");
    event.subscription_id = Some("sub-b".to_string());
    let f2 = engine.record_failure(event).unwrap();

    let admin = Caller::admin("admin-1");
    let c1 = engine
        .create_campaign(campaign_params("c1", &f1.failure_id), &admin)
        .unwrap();
    let c2 = engine
        .create_campaign(campaign_params("c1", &f2.failure_id), &admin)
        .unwrap();

    assert_eq!(c1.ab_test_group, c2.ab_test_group);
}

#[test]
fn one_campaign_per_failure() {
    let (engine, _) = RecoveryEngine::build_test("dn-unique", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");

    engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();
    let err = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::InvalidState { .. }));
}

#[test]
fn campaign_requires_matching_customer() {
    let (engine, _) = RecoveryEngine::build_test("dn-owner", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    let err = engine
        .create_campaign(
            campaign_params("c2", &failure.failure_id),
            &Caller::admin("admin-1"),
        )
        .unwrap_err();
    assert!(matches!(err, RecoveryError::Validation(_)));
}

#[test]
fn advance_step_dispatches_and_schedules_the_next_offset() {
    let (mut engine, _) = RecoveryEngine::build_test("dn-advance", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();
    let started_at = campaign.started_at;

    let advanced = engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();

    assert_eq!(advanced.sequence_step, 2);
    assert_eq!(advanced.last_communication_at, Some(engine.now()));
    // Second step offset in the standard template is 72 hours.
    assert_eq!(
        advanced.next_communication_at,
        Some(started_at + Duration::hours(72))
    );
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        1
    );
}

/// Exhausting all five steps completes the campaign exactly once and
/// never pushes sequence_step past total_steps.
#[test]
fn sequence_exhaustion_completes_exactly_once() {
    let (mut engine, _) = RecoveryEngine::build_test("dn-exhaust", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();

    for _ in 0..5 {
        engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();
    }

    let finished = engine.store().get_campaign(&campaign.campaign_id).unwrap();
    assert_eq!(finished.status, CampaignStatus::Completed);
    assert_eq!(finished.sequence_step, 5, "step never exceeds total_steps");
    assert!(finished.completed_at.is_some());
    assert!(finished.next_communication_at.is_none());
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        5
    );
    assert_eq!(engine.store().audit_count("campaign_completed").unwrap(), 1);

    let err = engine
        .advance_campaign(&campaign.campaign_id, &admin)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::InvalidState { .. }));
}

/// The linked failure is re-checked when a step executes: a resolution
/// that raced past the scheduler completes the campaign instead of
/// sending another notice.
#[test]
fn due_step_observes_failure_resolved_out_of_band() {
    let (mut engine, _) = RecoveryEngine::build_test("dn-race", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();

    // Another worker resolved the failure between scheduling and execution.
    engine
        .store()
        .resolve_failure(&failure.failure_id, ResolutionType::PaymentSucceeded, engine.now())
        .unwrap();

    let after = engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();
    assert_eq!(after.status, CampaignStatus::Completed);
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        0,
        "no notice goes out for a resolved failure"
    );
}

#[test]
fn update_campaign_is_admin_only() {
    let (engine, _) = RecoveryEngine::build_test("dn-auth", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();

    let err = engine
        .update_campaign(
            UpdateCampaignRequest {
                campaign_id: campaign.campaign_id.clone(),
                status: Some(CampaignStatus::Paused),
                communication_channels: None,
                metadata: None,
            },
            &Caller::customer("c1"),
        )
        .unwrap_err();

    assert!(matches!(err, RecoveryError::AccessDenied { .. }));
    assert_eq!(engine.store().audit_count("access_denied").unwrap(), 1);
    let unchanged = engine.store().get_campaign(&campaign.campaign_id).unwrap();
    assert_eq!(unchanged.status, CampaignStatus::Active);
}

#[test]
fn update_campaign_merges_metadata_key_wise() {
    let (engine, _) = RecoveryEngine::build_test("dn-metadata", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");

    let mut params = campaign_params("c1", &failure.failure_id);
    params.metadata = Some(serde_json::json!({"owner": "billing-ops", "priority": "low"}));
    let campaign = engine.create_campaign(params, &admin).unwrap();

    let updated = engine
        .update_campaign(
            UpdateCampaignRequest {
                campaign_id: campaign.campaign_id.clone(),
                status: None,
                communication_channels: None,
                metadata: Some(serde_json::json!({"priority": "high", "ticket": "OPS-412"})),
            },
            &admin,
        )
        .unwrap();

    assert_eq!(
        updated.metadata,
        serde_json::json!({
            "owner": "billing-ops",
            "priority": "high",
            "ticket": "OPS-412",
        })
    );
}

/// A cancel always beats a due communication, even when the step was
/// already scheduled before the cancel landed.
#[test]
fn canceled_campaign_sends_nothing_from_the_sweep() {
    let (mut engine, _) = RecoveryEngine::build_test("dn-cancel", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();

    engine
        .update_campaign(
            UpdateCampaignRequest {
                campaign_id: campaign.campaign_id.clone(),
                status: Some(CampaignStatus::Canceled),
                communication_channels: None,
                metadata: None,
            },
            &admin,
        )
        .unwrap();

    engine.advance_clock(Duration::hours(1));
    engine.run_sweep().unwrap();

    let after = engine.store().get_campaign(&campaign.campaign_id).unwrap();
    assert_eq!(after.status, CampaignStatus::Canceled);
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        0
    );
}

#[test]
fn paused_campaign_skips_steps_until_resumed() {
    let (mut engine, _) = RecoveryEngine::build_test("dn-pause", declines(8)).unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();

    let pause = |status| UpdateCampaignRequest {
        campaign_id: campaign.campaign_id.clone(),
        status: Some(status),
        communication_channels: None,
        metadata: None,
    };
    engine.update_campaign(pause(CampaignStatus::Paused), &admin).unwrap();

    engine.advance_clock(Duration::hours(2));
    engine.run_sweep().unwrap();
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        0
    );

    engine.update_campaign(pause(CampaignStatus::Active), &admin).unwrap();
    engine.run_sweep().unwrap();
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        1
    );
}

/// When every channel's transport is down, the step is rescheduled
/// after the configured delay instead of being skipped or advanced.
#[test]
fn notifier_outage_reschedules_the_step() {
    let store = RecoveryStore::open_shared_memory("dn-flaky").unwrap();
    store.migrate().unwrap();
    let config = RecoveryConfig::default_test();
    // Three transport attempts, all failing, for the first step's send.
    let mut engine = RecoveryEngine::build(
        &store,
        config,
        Clock::fixed(test_epoch()),
        Box::new(ScriptedProcessor::new(declines(8))),
        Box::new(FlakyNotifier::new(3)),
    )
    .unwrap();

    let failure = engine.record_failure(renewal_event("evt-1", "c1")).unwrap();
    let admin = Caller::admin("admin-1");
    let campaign = engine
        .create_campaign(campaign_params("c1", &failure.failure_id), &admin)
        .unwrap();

    let after = engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();
    assert_eq!(after.sequence_step, 1, "step is not consumed by an outage");
    assert_eq!(after.current_step_status, CampaignStepStatus::RetryScheduled);
    assert_eq!(
        after.next_communication_at,
        Some(engine.now() + Duration::minutes(30))
    );
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        0
    );

    // Transport recovered: the retried step goes out and advances.
    engine.advance_clock(Duration::minutes(30));
    let after = engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();
    assert_eq!(after.sequence_step, 2);
    assert_eq!(
        engine.store().communication_count(&campaign.campaign_id).unwrap(),
        1
    );
}

/// Failures that consume a retry qualify for automatic campaign
/// creation on the next sweep pass.
#[test]
fn sweep_auto_creates_campaigns_for_qualifying_failures() {
    let (mut engine, _) = RecoveryEngine::build_test("dn-auto", declines(8)).unwrap();
    engine.record_failure(renewal_event("evt-1", "c1")).unwrap();

    assert!(engine
        .list_campaigns(&CampaignFilter::default())
        .unwrap()
        .is_empty());

    // Past the first retry: the attempt fails and the failure qualifies.
    engine.advance_clock(Duration::hours(2));
    engine.run_sweep().unwrap();

    let campaigns = engine
        .list_campaigns(&CampaignFilter {
            customer_id: Some("c1".to_string()),
            ..CampaignFilter::default()
        })
        .unwrap();
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].campaign_type, "standard");
    assert_eq!(campaigns[0].status, CampaignStatus::Active);

    let failure = &engine.list_failures(&Default::default()).unwrap()[0];
    assert_eq!(failure.status, FailureStatus::Retrying);
    assert!(failure.retry_count >= 1);
}
