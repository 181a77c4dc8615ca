//! Delivery of billing events to downstream consumers.
//!
//! Called only after the transition that produced the events has committed. A failed
//! delivery is logged and counted by the caller; it never undoes billing state.

use crate::engine::BillingEvent;
use crate::services::metrics::record_notification_failure;
use async_trait::async_trait;
use service_core::observability::WithTraceContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webhook responded with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify(&self, event: &BillingEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl EventNotifier for LogNotifier {
    async fn notify(&self, event: &BillingEvent) -> Result<(), NotifyError> {
        info!(
            event = event.name(),
            client_id = %event.client_id(),
            payload = %serde_json::to_string(event).unwrap_or_default(),
            "Billing event"
        );
        Ok(())
    }
}

/// POSTs each event as JSON, carrying the current trace context.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventNotifier for WebhookNotifier {
    #[instrument(skip(self, event), fields(event = event.name()))]
    async fn notify(&self, event: &BillingEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .with_trace_context()
            .header("x-billing-event", event.name())
            .json(event)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Deliver `events` in order. Failures are logged and counted, never returned.
pub async fn dispatch(notifier: &Arc<dyn EventNotifier>, events: &[BillingEvent]) {
    for event in events {
        if let Err(e) = notifier.notify(event).await {
            warn!(
                error = %e,
                event = event.name(),
                client_id = %event.client_id(),
                "Failed to deliver billing event"
            );
            record_notification_failure(event.name());
        }
    }
}
