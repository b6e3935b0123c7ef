//! Payment recovery orchestration engine.
//!
//! Coordinates three coupled lifecycles for a subscription billing
//! platform: automated payment retries for failed charges, escalating
//! dunning campaigns, and tiered account-access restrictions derived
//! from billing health. All scheduling state is persistent; work is
//! executed by an explicit sweep over due rows plus on-demand calls,
//! both guarded by optimistic per-row state checks.

pub mod account_state;
pub mod analytics;
pub mod caller;
pub mod clock;
pub mod config;
pub mod dunning_engine;
pub mod engine;
pub mod error;
pub mod event;
pub mod failure_tracker;
pub mod notifier;
pub mod processor;
pub mod rng;
pub mod store;
pub mod sweep;
pub mod types;
