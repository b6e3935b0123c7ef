//! Shared primitive types used across the entire engine.

use crate::error::{RecoveryError, RecoveryResult};

/// A stable, unique identifier for any entity (customer, failure,
/// campaign, subscription, payment method).
pub type EntityId = String;

/// Reject blank identifiers before any lookup or mutation happens.
pub fn require_id(field: &'static str, value: &str) -> RecoveryResult<()> {
    if value.trim().is_empty() {
        return Err(RecoveryError::Validation(format!(
            "{field} must be a non-empty identifier"
        )));
    }
    Ok(())
}
