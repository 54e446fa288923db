//! Delivery executor: fans one payload out to every active subscription,
//! retrying transient failures with exponential backoff.
//!
//! Each subscription is independent; one dead endpoint never blocks the
//! others. A permanent failure (endpoint gone) deactivates the
//! subscription immediately with zero retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use nudge_core::config::PushConfig;
use nudge_core::error::Result;
use nudge_core::traits::{
    DeliveryReport, DeliveryService, PushTransport, SubscriptionRegistry,
};
use nudge_core::types::{DeliveryLogEntry, Notification, PushPayload, PushSubscription};

/// How many endpoint-requested waits (Retry-After) are honored per
/// subscription before they start consuming regular retry attempts.
const MAX_RETRY_AFTER_DEFERRALS: u32 = 2;

/// Longest single backoff sleep, regardless of what the endpoint asks.
const MAX_BACKOFF_SECS: u64 = 60;

pub struct DeliveryExecutor {
    transport: Arc<dyn PushTransport>,
    registry: Arc<dyn SubscriptionRegistry>,
    config: PushConfig,
}

impl DeliveryExecutor {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        registry: Arc<dyn SubscriptionRegistry>,
        config: PushConfig,
    ) -> Self {
        Self { transport, registry, config }
    }

    /// Push to one subscription, retrying transient failures. Returns the
    /// terminal log entry for this (notification, subscription) pair.
    async fn send_one(
        &self,
        notification_id: &str,
        sub: &PushSubscription,
        payload: &PushPayload,
    ) -> DeliveryLogEntry {
        let mut deferrals = 0u32;
        let mut last_error = String::from("unknown transport error");

        let mut attempt = 0u32;
        while attempt <= self.config.max_retries {
            let reply = self.transport.send(sub, payload).await;

            if reply.success {
                if let Err(e) = self.registry.mark_used(&sub.id).await {
                    tracing::warn!("⚠️ Failed to mark subscription {} used: {e}", sub.id);
                }
                let mut entry = DeliveryLogEntry::sent(notification_id, &sub.id);
                if let Some(id) = reply.delivery_id {
                    entry.id = id;
                }
                return entry;
            }

            last_error = reply.error.unwrap_or_else(|| "unknown transport error".into());

            if reply.permanent_failure {
                tracing::info!(
                    "🗑️ Endpoint for subscription {} is gone, deactivating",
                    sub.id
                );
                if let Err(e) = self.registry.deactivate(&sub.id).await {
                    tracing::warn!("⚠️ Failed to deactivate subscription {}: {e}", sub.id);
                }
                return DeliveryLogEntry::failed(notification_id, &sub.id, &last_error);
            }

            // The endpoint asked us to back off. Honor a couple of these
            // without burning a retry, then fall back to normal counting.
            if let Some(wait) = reply.retry_after_secs {
                if deferrals < MAX_RETRY_AFTER_DEFERRALS {
                    deferrals += 1;
                    tokio::time::sleep(Duration::from_secs(wait.min(MAX_BACKOFF_SECS))).await;
                    continue;
                }
            }

            attempt += 1;
            if attempt <= self.config.max_retries {
                let delay = self
                    .config
                    .retry_delay_secs
                    .saturating_mul(1 << attempt.min(16))
                    .min(MAX_BACKOFF_SECS);
                tracing::debug!(
                    "🔁 Retry {attempt}/{} for subscription {} in {delay}s",
                    self.config.max_retries,
                    sub.id
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }

        DeliveryLogEntry::failed(
            notification_id,
            &sub.id,
            &format!("gave up after {} attempts: {last_error}", self.config.max_retries + 1),
        )
    }
}

#[async_trait]
impl DeliveryService for DeliveryExecutor {
    async fn deliver(&self, n: &Notification, payload: &PushPayload) -> Result<DeliveryReport> {
        let subs = self.registry.list_active(&n.user_id).await?;
        if subs.is_empty() {
            tracing::debug!("📭 No active subscriptions for {}", n.user_id);
            return Ok(DeliveryReport::default());
        }

        let attempts = subs.iter().map(|sub| self.send_one(&n.id, sub, payload));
        let entries = join_all(attempts).await;

        let mut report = DeliveryReport::default();
        for entry in entries {
            match entry.status {
                nudge_core::types::DeliveryStatus::Sent => report.successful += 1,
                _ => report.failed += 1,
            }
            report.entries.push(entry);
        }
        Ok(report)
    }
}
