//! Daily recovery metrics tests.

use recovery_core::{
    analytics::AnalyticsFilter,
    caller::Caller,
    dunning_engine::CreateCampaignParams,
    engine::RecoveryEngine,
    failure_tracker::{FailureEvent, RetryRequest},
    processor::ScriptedCharge,
};

fn renewal_event(key: &str, customer: &str, amount: f64) -> FailureEvent {
    FailureEvent {
        idempotency_key: key.to_string(),
        customer_id: customer.to_string(),
        subscription_id: Some(format!("sub-{customer}")),
        amount,
        currency: "USD".to_string(),
        failure_reason: "insufficient funds".to_string(),
        failure_code: "card_declined".to_string(),
    }
}

fn retry(failure_id: &str) -> RetryRequest {
    RetryRequest {
        failure_id: failure_id.to_string(),
        payment_method_id: None,
        skip_retry_count: false,
    }
}

#[test]
fn daily_metrics_compute_recovery_rate_and_revenue() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "an-rate",
        vec![
            ScriptedCharge::Approve,
            ScriptedCharge::Decline("card_declined"),
        ],
    )
    .unwrap();
    let f1 = engine.record_failure(renewal_event("evt-1", "c1", 100.0)).unwrap();
    let f2 = engine.record_failure(renewal_event("evt-2", "c2", 40.0)).unwrap();

    engine.retry_payment(retry(&f1.failure_id), &Caller::customer("c1")).unwrap();
    engine.retry_payment(retry(&f2.failure_id), &Caller::customer("c2")).unwrap();

    let records = engine
        .generate_daily_metrics(engine.now().date_naive())
        .unwrap();

    // No campaigns yet: everything lands in the ("none", "general") group.
    assert_eq!(records.len(), 1);
    let row = &records[0];
    assert_eq!(row.campaign_type, "none");
    assert_eq!(row.customer_segment, "general");
    assert_eq!(row.total_failures, 2);
    assert_eq!(row.resolved_failures, 1);
    assert!((row.recovery_rate - 0.5).abs() < 1e-9);
    assert!((row.revenue_recovered - 100.0).abs() < 1e-9);
}

#[test]
fn regeneration_is_idempotent() {
    let (mut engine, _) =
        RecoveryEngine::build_test("an-idempotent", vec![ScriptedCharge::Approve]).unwrap();
    let f1 = engine.record_failure(renewal_event("evt-1", "c1", 100.0)).unwrap();
    engine.retry_payment(retry(&f1.failure_id), &Caller::customer("c1")).unwrap();

    let date = engine.now().date_naive();
    let first = engine.generate_daily_metrics(date).unwrap();
    let second = engine.generate_daily_metrics(date).unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(engine.store().daily_metrics_row_count().unwrap(), 1);
    assert_eq!(second[0].total_failures, first[0].total_failures);
    assert_eq!(second[0].resolved_failures, first[0].resolved_failures);
}

/// Engagement receipts flow back asynchronously and show up in the
/// campaign group's open rate.
#[test]
fn engagement_receipts_feed_the_open_rate() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "an-engagement",
        vec![ScriptedCharge::Decline("card_declined"); 4],
    )
    .unwrap();
    let failure = engine.record_failure(renewal_event("evt-1", "c1", 49.0)).unwrap();
    let admin = Caller::admin("admin-1");

    let campaign = engine
        .create_campaign(
            CreateCampaignParams {
                customer_id: "c1".to_string(),
                payment_failure_id: failure.failure_id.clone(),
                campaign_type: "standard".to_string(),
                communication_channels: None,
                customer_segment: Some("smb".to_string()),
                personalization: None,
                ab_test_group: None,
                metadata: None,
            },
            &admin,
        )
        .unwrap();
    engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();

    let sent = engine
        .store()
        .communications_for_campaign(&campaign.campaign_id)
        .unwrap();
    assert_eq!(sent.len(), 1);
    engine.record_engagement(&sent[0].receipt_id, true).unwrap();

    let records = engine
        .generate_daily_metrics(engine.now().date_naive())
        .unwrap();
    let row = records
        .iter()
        .find(|r| r.campaign_type == "standard" && r.customer_segment == "smb")
        .expect("campaign group row");
    assert_eq!(row.communications_sent, 1);
    assert!((row.open_rate - 1.0).abs() < 1e-9);
}

#[test]
fn get_analytics_filters_by_campaign_type() {
    let (mut engine, _) = RecoveryEngine::build_test(
        "an-filter",
        vec![ScriptedCharge::Decline("card_declined"); 4],
    )
    .unwrap();
    let f1 = engine.record_failure(renewal_event("evt-1", "c1", 49.0)).unwrap();
    engine.record_failure(renewal_event("evt-2", "c2", 20.0)).unwrap();
    let admin = Caller::admin("admin-1");

    let campaign = engine
        .create_campaign(
            CreateCampaignParams {
                customer_id: "c1".to_string(),
                payment_failure_id: f1.failure_id.clone(),
                campaign_type: "standard".to_string(),
                communication_channels: None,
                customer_segment: None,
                personalization: None,
                ab_test_group: None,
                metadata: None,
            },
            &admin,
        )
        .unwrap();
    engine.advance_campaign(&campaign.campaign_id, &admin).unwrap();

    engine
        .generate_daily_metrics(engine.now().date_naive())
        .unwrap();

    let all = engine.get_analytics(&AnalyticsFilter::default()).unwrap();
    assert_eq!(all.len(), 2, "one campaign group, one uncovered group");

    let standard_only = engine
        .get_analytics(&AnalyticsFilter {
            campaign_type: Some("standard".to_string()),
            ..AnalyticsFilter::default()
        })
        .unwrap();
    assert_eq!(standard_only.len(), 1);
    assert_eq!(standard_only[0].campaign_type, "standard");
    assert_eq!(standard_only[0].total_failures, 1);
}
