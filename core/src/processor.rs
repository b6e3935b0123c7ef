//! Payment processor boundary.
//!
//! The engine never speaks a gateway wire protocol. It hands a charge
//! request to this trait and interprets the outcome: a transport error
//! is retried a fixed number of times (RetryPolicyConfig::
//! transport_attempts) and, once exhausted, consumed as a business
//! retry attempt rather than surfaced to the caller.

use crate::rng::EntityRng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub failure_id: String,
    pub customer_id: String,
    pub payment_method_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    /// One key per business attempt, so a transport-level replay of the
    /// same attempt can never charge twice.
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub error_code: Option<String>,
}

/// The transport failed before the processor produced a decision.
#[derive(Debug, Error)]
#[error("payment processor transport failure: {0}")]
pub struct TransportError(pub String);

pub trait PaymentProcessor: Send {
    fn charge(&mut self, request: &ChargeRequest) -> Result<ChargeOutcome, TransportError>;
}

/// Deterministic processor for the runner: declines a configurable
/// fraction of charges, keyed off the idempotency key so reruns agree.
pub struct StubProcessor {
    decline_rate: f64,
}

impl StubProcessor {
    pub fn new(decline_rate: f64) -> Self {
        Self { decline_rate }
    }
}

impl PaymentProcessor for StubProcessor {
    fn charge(&mut self, request: &ChargeRequest) -> Result<ChargeOutcome, TransportError> {
        let mut rng = EntityRng::for_entity("stub_processor", &request.idempotency_key, 0);
        if rng.chance(self.decline_rate) {
            Ok(ChargeOutcome {
                success: false,
                transaction_id: None,
                error_code: Some("card_declined".to_string()),
            })
        } else {
            Ok(ChargeOutcome {
                success: true,
                transaction_id: Some(format!("txn-{}", Uuid::new_v4())),
                error_code: None,
            })
        }
    }
}

/// One scripted response per charge call. Used by tests to drive exact
/// approve/decline/outage sequences and to count issued charges.
#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Approve,
    Decline(&'static str),
    TransportDown,
}

pub type ChargeLog = Arc<Mutex<Vec<ChargeRequest>>>;

pub struct ScriptedProcessor {
    script: VecDeque<ScriptedCharge>,
    log: ChargeLog,
}

impl ScriptedProcessor {
    pub fn new(script: Vec<ScriptedCharge>) -> Self {
        Self {
            script: script.into(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle for asserting on issued charges after the engine has
    /// taken ownership of the processor.
    pub fn log_handle(&self) -> ChargeLog {
        Arc::clone(&self.log)
    }
}

impl PaymentProcessor for ScriptedProcessor {
    fn charge(&mut self, request: &ChargeRequest) -> Result<ChargeOutcome, TransportError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(request.clone());
        }
        match self.script.pop_front() {
            Some(ScriptedCharge::Approve) | None => Ok(ChargeOutcome {
                success: true,
                transaction_id: Some(format!("txn-{}", Uuid::new_v4())),
                error_code: None,
            }),
            Some(ScriptedCharge::Decline(code)) => Ok(ChargeOutcome {
                success: false,
                transaction_id: None,
                error_code: Some(code.to_string()),
            }),
            Some(ScriptedCharge::TransportDown) => {
                Err(TransportError("connection refused".to_string()))
            }
        }
    }
}
