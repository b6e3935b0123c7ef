//! Sweep task trait.
//!
//! RULE: Every service that owns scheduled work implements SweepTask.
//! The engine calls sweep() on each registered task in a fixed order,
//! every pass. Execution order is documented in engine.rs.
//!
//! A sweep pass holds no in-memory schedule. Due work is whatever the
//! store says is due at `now`, so any number of worker processes can
//! run passes concurrently; per-row optimistic status checks keep them
//! from executing the same action twice.

use crate::{error::RecoveryResult, event::RecoveryEvent};
use chrono::{DateTime, Utc};
use std::any::Any;

pub trait SweepTask: Send {
    /// Unique stable name for this task.
    fn name(&self) -> &'static str;

    /// Execute everything due at `now`. Returns the events describing
    /// what the pass did (already audited by the operations themselves).
    fn sweep(&mut self, now: DateTime<Utc>) -> RecoveryResult<Vec<RecoveryEvent>>;

    /// For downcasting in tests and tooling only.
    fn as_any(&self) -> &dyn Any;
}
