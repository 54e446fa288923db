//! Collaborator traits — the seams the pipeline is wired through.
//!
//! Every external dependency (push transport, subscription registry, flow
//! signals, delivery fan-out) is constructor-injected behind one of these
//! traits; there are no runtime fallback chains. A missing capability is
//! expressed by passing an explicit no-op implementation such as
//! [`NeutralFlow`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{
    DeliveryLogEntry, FlowComponents, FlowScore, Notification, PushPayload, PushSubscription,
};

/// The transport's answer to one push attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportReply {
    pub success: bool,
    /// Transport-assigned delivery ID, when available.
    pub delivery_id: Option<String>,
    pub error: Option<String>,
    /// Endpoint is permanently gone — deactivate, never retry.
    pub permanent_failure: bool,
    /// Transport asked us to wait this many seconds before retrying.
    pub retry_after_secs: Option<u64>,
}

impl TransportReply {
    pub fn ok(delivery_id: Option<String>) -> Self {
        Self { success: true, delivery_id, ..Self::default() }
    }

    pub fn gone(error: &str) -> Self {
        Self { permanent_failure: true, error: Some(error.to_string()), ..Self::default() }
    }

    pub fn transient(error: &str) -> Self {
        Self { error: Some(error.to_string()), ..Self::default() }
    }
}

/// Black-box push transport. Wire details (encryption, protocol) live
/// behind this seam.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &PushPayload) -> TransportReply;
}

/// Read-mostly view of the subscription registry.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    /// Active subscriptions for a user. Never returns inactive rows.
    async fn list_active(&self, user_id: &str) -> Result<Vec<PushSubscription>>;
    /// Permanently deactivate an endpoint (gone/expired).
    async fn deactivate(&self, subscription_id: &str) -> Result<()>;
    /// Record a successful use of the endpoint.
    async fn mark_used(&self, subscription_id: &str) -> Result<()>;
}

/// Capability seam for flow detection. The queue only needs a score; how
/// it is produced (activity fusion, manual override) is the flow crate's
/// business.
#[async_trait]
pub trait FlowSignalSource: Send + Sync {
    async fn score(&self, user_id: &str) -> Result<FlowScore>;
}

/// No-op flow source: always neutral, never in flow. Used when flow
/// detection is disabled at construction time.
pub struct NeutralFlow;

#[async_trait]
impl FlowSignalSource for NeutralFlow {
    async fn score(&self, _user_id: &str) -> Result<FlowScore> {
        Ok(FlowScore {
            score: 50,
            in_flow: false,
            deep_flow: false,
            source: "neutral".into(),
            components: FlowComponents { activity: 50.0, response: 50.0, historical: 50.0 },
            estimated_end: None,
        })
    }
}

/// Outcome of fanning one payload out to a user's subscriptions.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Subscriptions that accepted the push.
    pub successful: u32,
    /// Subscriptions that exhausted retries (or had none to begin with).
    pub failed: u32,
    /// One entry per subscription attempted, success or terminal failure.
    pub entries: Vec<DeliveryLogEntry>,
}

impl DeliveryReport {
    /// A notification counts as sent if at least one subscription took it.
    pub fn any_success(&self) -> bool {
        self.successful > 0
    }
}

/// Executes the actual delivery (retry, backoff, invalidation) for one
/// notification-shaped payload.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, notification: &Notification, payload: &PushPayload)
    -> Result<DeliveryReport>;
}
