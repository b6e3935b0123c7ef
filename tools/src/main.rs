//! recovery-runner: headless runner for the payment recovery engine.
//!
//! Usage:
//!   recovery-runner --customers 20 --days 30 --decline-rate 0.6 --db run.db
//!   recovery-runner --data-dir ./data

use anyhow::Result;
use chrono::Duration;
use recovery_core::{
    clock::Clock,
    config::RecoveryConfig,
    dunning_engine::CampaignStatus,
    engine::{test_epoch, RecoveryEngine},
    failure_tracker::{FailureEvent, FailureStatus},
    notifier::LogNotifier,
    processor::StubProcessor,
    store::RecoveryStore,
};
use std::env;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let customers = parse_arg(&args, "--customers", 20usize);
    let days = parse_arg(&args, "--days", 30u64);
    let decline_rate = parse_arg(&args, "--decline-rate", 0.6f64);
    let json_summary = args.iter().any(|a| a == "--json");
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let data_dir = args
        .windows(2)
        .find(|w| w[0] == "--data-dir")
        .map(|w| w[1].as_str())
        .unwrap_or("./data");

    if !json_summary {
        println!("recovery-runner");
        println!("  customers:    {customers}");
        println!("  days:         {days}");
        println!("  decline_rate: {decline_rate}");
        println!("  db:           {db}");
        println!("  data_dir:     {data_dir}");
        println!();
    }

    // For :memory: use a SQLite shared-cache URI so the engine's
    // per-service connections all see the same in-memory database.
    let db_effective: String = if db == ":memory:" {
        "file:recovery_run?mode=memory&cache=shared".to_string()
    } else {
        db.to_string()
    };
    let store = RecoveryStore::open(&db_effective)?;
    store.migrate()?;

    let config = RecoveryConfig::load(data_dir)?;
    let start = test_epoch();
    let mut engine = RecoveryEngine::build(
        &store,
        config,
        Clock::fixed(start),
        Box::new(StubProcessor::new(decline_rate)),
        Box::new(LogNotifier),
    )?;

    // Seed one failed renewal charge per customer.
    for i in 0..customers {
        let customer_id = format!("cust-{i:04}");
        engine.record_failure(FailureEvent {
            idempotency_key: format!("evt-renewal-{i:04}"),
            customer_id,
            subscription_id: Some(format!("sub-{i:04}")),
            amount: 19.0 + (i % 5) as f64 * 10.0,
            currency: "USD".to_string(),
            failure_reason: "insufficient funds".to_string(),
            failure_code: "card_declined".to_string(),
        })?;
    }

    // Four sweep passes per simulated day.
    for _ in 0..days * 4 {
        engine.advance_clock(Duration::hours(6));
        engine.run_sweep()?;
    }

    if json_summary {
        print_json_summary(&engine)?;
    } else {
        print_summary(&engine, days)?;
    }
    Ok(())
}

fn print_json_summary(engine: &RecoveryEngine) -> Result<()> {
    let store = engine.store();
    let summary = serde_json::json!({
        "failures": {
            "pending":   store.failure_count_by_status(FailureStatus::Pending)?,
            "retrying":  store.failure_count_by_status(FailureStatus::Retrying)?,
            "resolved":  store.failure_count_by_status(FailureStatus::Resolved)?,
            "escalated": store.failure_count_by_status(FailureStatus::Escalated)?,
            "abandoned": store.failure_count_by_status(FailureStatus::Abandoned)?,
        },
        "campaigns": {
            "active":    store.campaign_count_by_status(CampaignStatus::Active)?,
            "paused":    store.campaign_count_by_status(CampaignStatus::Paused)?,
            "completed": store.campaign_count_by_status(CampaignStatus::Completed)?,
            "canceled":  store.campaign_count_by_status(CampaignStatus::Canceled)?,
        },
        "metric_rows": store.daily_metrics_row_count()?,
        "audit_entries": store.audit_total()?,
    });
    println!("{summary}");
    Ok(())
}

fn print_summary(engine: &RecoveryEngine, days: u64) -> Result<()> {
    let store = engine.store();
    println!("summary after {days} simulated days");
    println!("  payment failures:");
    for status in [
        FailureStatus::Pending,
        FailureStatus::Retrying,
        FailureStatus::Resolved,
        FailureStatus::Escalated,
        FailureStatus::Abandoned,
    ] {
        println!(
            "    {:<10} {}",
            status.as_str(),
            store.failure_count_by_status(status)?
        );
    }
    println!("  dunning campaigns:");
    for status in [
        CampaignStatus::Active,
        CampaignStatus::Paused,
        CampaignStatus::Completed,
        CampaignStatus::Canceled,
    ] {
        println!(
            "    {:<10} {}",
            status.as_str(),
            store.campaign_count_by_status(status)?
        );
    }
    println!("  metric rows:   {}", store.daily_metrics_row_count()?);
    println!("  audit entries: {}", store.audit_total()?);
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
