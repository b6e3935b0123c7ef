//! The recovery engine: wiring, the public operation surface, and the
//! sweep loop.
//!
//! SWEEP ORDER (fixed, documented, never reordered):
//!   1. failure_tracker  due payment retries
//!   2. account_state    grace/suspension deadlines and restorations
//!   3. dunning_engine   campaign auto-creation and due communications
//!   4. analytics        daily metric rollup
//!
//! RULES:
//!   - Services mutate entities only through the store. No service
//!     calls another service's methods; cross-entity cascades go
//!     through the store plus the module-level recalculation and
//!     termination routines.
//!   - Whoever mutates, audits. Every state change appends to the
//!     audit log inside the operation that performs it.
//!   - All due-work timestamps live in the store. A sweep pass holds
//!     no in-memory schedule, so any number of worker processes can
//!     run passes over the same database.

use crate::{
    account_state::{AccountState, AccountStateMachine, FeatureAccess, UpdateAccountStateRequest},
    analytics::{AnalyticsAggregator, AnalyticsFilter, RecoveryAnalyticsRecord},
    caller::Caller,
    clock::Clock,
    config::RecoveryConfig,
    dunning_engine::{
        CampaignFilter, CreateCampaignParams, DunningCampaign, DunningEngine,
        UpdateCampaignRequest,
    },
    error::RecoveryResult,
    event::RecoveryEvent,
    failure_tracker::{
        FailureEvent, FailureFilter, FailureTracker, PaymentFailure, RetryOutcome, RetryRequest,
    },
    notifier::{LogNotifier, Notifier},
    processor::{ChargeLog, PaymentProcessor, ScriptedCharge, ScriptedProcessor},
    store::RecoveryStore,
    sweep::SweepTask,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};

pub struct RecoveryEngine {
    clock: Clock,
    store: RecoveryStore,
    failures: FailureTracker,
    accounts: AccountStateMachine,
    dunning: DunningEngine,
    analytics: AnalyticsAggregator,
}

impl RecoveryEngine {
    /// Build a fully wired engine. Each service gets its own connection
    /// to the same database.
    pub fn build(
        store: &RecoveryStore,
        config: RecoveryConfig,
        clock: Clock,
        processor: Box<dyn PaymentProcessor>,
        notifier: Box<dyn Notifier>,
    ) -> RecoveryResult<Self> {
        Ok(Self {
            failures: FailureTracker::new(store.reopen()?, config.clone(), processor),
            accounts: AccountStateMachine::new(store.reopen()?, config.clone()),
            dunning: DunningEngine::new(store.reopen()?, config, notifier),
            analytics: AnalyticsAggregator::new(store.reopen()?),
            store: store.reopen()?,
            clock,
        })
    }

    /// Engine over a shared in-memory database with a scripted
    /// processor, a frozen clock, and the default test config. Returns
    /// the charge log handle so tests can count issued charges.
    pub fn build_test(tag: &str, script: Vec<ScriptedCharge>) -> RecoveryResult<(Self, ChargeLog)> {
        let store = RecoveryStore::open_shared_memory(tag)?;
        store.migrate()?;
        let processor = ScriptedProcessor::new(script);
        let charge_log = processor.log_handle();
        let engine = Self::build(
            &store,
            RecoveryConfig::default_test(),
            Clock::fixed(test_epoch()),
            Box::new(processor),
            Box::new(LogNotifier),
        )?;
        Ok((engine, charge_log))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Advance a fixed clock (tests and the runner).
    pub fn advance_clock(&mut self, by: Duration) -> DateTime<Utc> {
        self.clock.advance(by)
    }

    /// Read access for tests, tooling, and end-of-run summaries.
    pub fn store(&self) -> &RecoveryStore {
        &self.store
    }

    /// One sweep pass: execute everything due at the clock's now.
    pub fn run_sweep(&mut self) -> RecoveryResult<Vec<RecoveryEvent>> {
        let now = self.clock.now();
        let mut all_events = Vec::new();
        let tasks: [&mut dyn SweepTask; 4] = [
            &mut self.failures,
            &mut self.accounts,
            &mut self.dunning,
            &mut self.analytics,
        ];
        for task in tasks {
            let events = task.sweep(now)?;
            if !events.is_empty() {
                log::info!("sweep {}: {} events", task.name(), events.len());
            }
            all_events.extend(events);
        }
        Ok(all_events)
    }

    // ── Payment failures ───────────────────────────────────────

    pub fn record_failure(&self, event: FailureEvent) -> RecoveryResult<PaymentFailure> {
        self.failures.record_failure(event, self.clock.now())
    }

    pub fn retry_payment(
        &mut self,
        request: RetryRequest,
        caller: &Caller,
    ) -> RecoveryResult<RetryOutcome> {
        let now = self.clock.now();
        self.failures.retry_payment(request, caller, now)
    }

    pub fn abandon_failure(
        &self,
        failure_id: &str,
        reason: &str,
        caller: &Caller,
    ) -> RecoveryResult<PaymentFailure> {
        self.failures
            .abandon_failure(failure_id, reason, caller, self.clock.now())
    }

    pub fn list_failures(&self, filter: &FailureFilter) -> RecoveryResult<Vec<PaymentFailure>> {
        self.failures.list_failures(filter)
    }

    // ── Dunning campaigns ──────────────────────────────────────

    pub fn create_campaign(
        &self,
        params: CreateCampaignParams,
        caller: &Caller,
    ) -> RecoveryResult<DunningCampaign> {
        self.dunning.create_campaign(params, caller, self.clock.now())
    }

    pub fn advance_campaign(
        &mut self,
        campaign_id: &str,
        caller: &Caller,
    ) -> RecoveryResult<DunningCampaign> {
        let now = self.clock.now();
        self.dunning.advance_step(campaign_id, caller, now)
    }

    pub fn update_campaign(
        &self,
        request: UpdateCampaignRequest,
        caller: &Caller,
    ) -> RecoveryResult<DunningCampaign> {
        self.dunning.update_campaign(request, caller, self.clock.now())
    }

    pub fn record_engagement(&self, receipt_id: &str, opened: bool) -> RecoveryResult<()> {
        self.dunning.record_engagement(receipt_id, opened)
    }

    pub fn list_campaigns(&self, filter: &CampaignFilter) -> RecoveryResult<Vec<DunningCampaign>> {
        self.dunning.list_campaigns(filter)
    }

    // ── Account states ─────────────────────────────────────────

    pub fn get_account_state(&self, customer_id: &str) -> RecoveryResult<AccountState> {
        self.accounts.get_account_state(customer_id, self.clock.now())
    }

    pub fn get_feature_restrictions(&self, customer_id: &str) -> RecoveryResult<FeatureAccess> {
        self.accounts
            .get_feature_restrictions(customer_id, self.clock.now())
    }

    pub fn update_account_state(
        &self,
        request: UpdateAccountStateRequest,
        caller: &Caller,
    ) -> RecoveryResult<AccountState> {
        self.accounts
            .update_account_state(request, caller, self.clock.now())
    }

    // ── Analytics ──────────────────────────────────────────────

    pub fn generate_daily_metrics(
        &self,
        date: NaiveDate,
    ) -> RecoveryResult<Vec<RecoveryAnalyticsRecord>> {
        self.analytics.generate_daily_metrics(date, self.clock.now())
    }

    pub fn get_analytics(
        &self,
        filter: &AnalyticsFilter,
    ) -> RecoveryResult<Vec<RecoveryAnalyticsRecord>> {
        self.analytics.get_analytics(filter)
    }
}

/// 2026-01-01T00:00:00Z, the frozen start time for test engines.
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
