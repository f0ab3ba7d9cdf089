use async_trait::async_trait;

use super::models::WebhookEvent;
use crate::{Error, Result};

/// One handler for events arriving on a webhook path.
///
/// Several processors may share a path; `should_process` decides which of
/// them see a given event, checked in registration order.
#[async_trait]
pub trait WebhookProcessor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether this processor wants the event at all.
    async fn should_process(&self, event: &WebhookEvent) -> bool;

    /// Verify the delivery came from the expected sender, e.g. by checking
    /// a signature header. Failing authentication drops the event for this
    /// processor without retries.
    async fn authenticate(&self, event: &WebhookEvent) -> bool;

    /// Structural check on the payload before handling.
    async fn validate_payload(&self, event: &WebhookEvent) -> bool;

    async fn handle_event(&self, event: &WebhookEvent) -> Result<()>;

    /// Whether a failed `handle_event` should be attempted again.
    fn should_retry(&self, _error: &Error) -> bool {
        false
    }

    /// Called before each retry attempt.
    async fn on_error(&self, _event: &WebhookEvent, _error: &Error) {}

    /// Called once on manager shutdown.
    async fn cancel(&self) {}
}
