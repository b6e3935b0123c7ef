//! Notification delivery boundary.
//!
//! Delivery transport (email/SMS/in-app providers) lives outside the
//! engine. Dispatch goes through this trait; engagement flows back
//! asynchronously via DunningEngine::record_engagement with the
//! receipt id returned here.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub receipt_id: String,
}

#[derive(Debug, Error)]
#[error("notifier transport failure: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send {
    fn send(
        &mut self,
        channel: &str,
        template: &str,
        personalization: &serde_json::Value,
    ) -> Result<DeliveryReceipt, NotifyError>;
}

/// Logs every send and fabricates a receipt. Default for the runner
/// and for tests that assert on store state rather than on deliveries.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(
        &mut self,
        channel: &str,
        template: &str,
        _personalization: &serde_json::Value,
    ) -> Result<DeliveryReceipt, NotifyError> {
        let receipt_id = format!("rcpt-{}", Uuid::new_v4());
        log::info!("notify: channel={channel} template={template} receipt={receipt_id}");
        Ok(DeliveryReceipt { receipt_id })
    }
}

/// Fails the first `outages` sends, then behaves like LogNotifier.
/// Used by tests to exercise transport exhaustion and rescheduling.
pub struct FlakyNotifier {
    outages: usize,
}

impl FlakyNotifier {
    pub fn new(outages: usize) -> Self {
        Self { outages }
    }
}

impl Notifier for FlakyNotifier {
    fn send(
        &mut self,
        channel: &str,
        template: &str,
        personalization: &serde_json::Value,
    ) -> Result<DeliveryReceipt, NotifyError> {
        if self.outages > 0 {
            self.outages -= 1;
            return Err(NotifyError("gateway timeout".to_string()));
        }
        LogNotifier.send(channel, template, personalization)
    }
}
