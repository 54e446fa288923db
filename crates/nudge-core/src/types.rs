//! Core data model — notifications, subscriptions, and delivery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A queued notification awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification ID.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Category (maps to default priority/batchability, e.g. "task_reminder").
    pub category: String,
    /// Short title.
    pub title: String,
    /// Body content.
    pub body: String,
    /// Priority 1–10, higher = more interruptive. 9+ bypasses quiet hours.
    pub priority: u8,
    /// Grouping key — notifications sharing it within the window collapse
    /// into one summary. None means never batched.
    pub batch_key: Option<String>,
    /// Batch window in seconds, anchored at the oldest member.
    pub batch_window_secs: Option<u32>,
    /// Earliest time this may be delivered.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// After this time the notification is dropped as expired.
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: NotificationStatus,
    /// Failure reason when status is `Failed`.
    pub error: Option<String>,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
    /// When delivery was handed to the transport.
    pub sent_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Create a new pending notification. Priority is clamped to 1–10.
    pub fn new(user_id: &str, category: &str, title: &str, body: &str, priority: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            category: category.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            priority: priority.clamp(1, 10),
            batch_key: None,
            batch_window_secs: None,
            scheduled_for: None,
            expires_at: None,
            status: NotificationStatus::Pending,
            error: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    /// Whether `expires_at` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Whether the notification is due (no schedule, or schedule passed).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_for {
            Some(at) => now >= at,
            None => true,
        }
    }
}

/// Notification lifecycle status.
///
/// `pending → {scheduled, batched, suppressed}* → sending → sent → delivered
/// → {clicked | dismissed}`, with `expired`, `cancelled`, and `failed`
/// reachable before `sent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Scheduled,
    Batched,
    Suppressed,
    Sending,
    Sent,
    Delivered,
    Clicked,
    Dismissed,
    Expired,
    Cancelled,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Batched => "batched",
            Self::Suppressed => "suppressed",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Clicked => "clicked",
            Self::Dismissed => "dismissed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            "batched" => Self::Batched,
            "suppressed" => Self::Suppressed,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "clicked" => Self::Clicked,
            "dismissed" => Self::Dismissed,
            "expired" => Self::Expired,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Statuses from which a user may still cancel.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled | Self::Batched)
    }
}

/// A registered push endpoint for a user's device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Unique subscription ID.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Push endpoint URL — unique per subscription.
    pub endpoint: String,
    /// Auth secret for the endpoint.
    pub auth: String,
    /// P256DH public key for the endpoint.
    pub p256dh: String,
    /// User agent of the device, if known.
    pub user_agent: Option<String>,
    /// User-provided device name.
    pub device_name: Option<String>,
    /// Inactive subscriptions are never selected for delivery.
    pub active: bool,
    /// Consecutive failed push attempts.
    pub fail_count: u32,
    /// Last successful push timestamp.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
}

impl PushSubscription {
    pub fn new(user_id: &str, endpoint: &str, auth: &str, p256dh: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            endpoint: endpoint.to_string(),
            auth: auth.to_string(),
            p256dh: p256dh.to_string(),
            user_agent: None,
            device_name: None,
            active: true,
            fail_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Structured payload handed to the push transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub action_url: Option<String>,
    /// Collapse tag — usually the batch key or category.
    pub tag: Option<String>,
}

impl PushPayload {
    /// Build a payload from a single notification.
    pub fn from_notification(n: &Notification) -> Self {
        Self {
            title: n.title.clone(),
            body: n.body.clone(),
            icon: None,
            action_url: None,
            tag: n.batch_key.clone().or_else(|| Some(n.category.clone())),
        }
    }
}

/// One delivery attempt outcome for a (notification, subscription) pair.
///
/// Timestamps are monotonically non-decreasing within an entry:
/// `sent_at ≤ delivered_at ≤ clicked_at/dismissed_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    /// Delivery ID — referenced by `record_delivery_event`.
    pub id: String,
    pub notification_id: String,
    /// None for batch-member bookkeeping rows.
    pub subscription_id: Option<String>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl DeliveryLogEntry {
    pub fn sent(notification_id: &str, subscription_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.to_string(),
            subscription_id: Some(subscription_id.to_string()),
            status: DeliveryStatus::Sent,
            error: None,
            sent_at: Utc::now(),
            delivered_at: None,
            clicked_at: None,
            dismissed_at: None,
        }
    }

    pub fn failed(notification_id: &str, subscription_id: &str, error: &str) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            error: Some(error.to_string()),
            ..Self::sent(notification_id, subscription_id)
        }
    }

    /// Bookkeeping row for a notification folded into a batch summary.
    pub fn batched(notification_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.to_string(),
            subscription_id: None,
            status: DeliveryStatus::Batched,
            error: None,
            sent_at: Utc::now(),
            delivered_at: None,
            clicked_at: None,
            dismissed_at: None,
        }
    }
}

/// Per-attempt delivery status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Clicked,
    Dismissed,
    Failed,
    Batched,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Clicked => "clicked",
            Self::Dismissed => "dismissed",
            Self::Failed => "failed",
            Self::Batched => "batched",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => Self::Delivered,
            "clicked" => Self::Clicked,
            "dismissed" => Self::Dismissed,
            "failed" => Self::Failed,
            "batched" => Self::Batched,
            _ => Self::Sent,
        }
    }
}

/// Client-reported delivery lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEvent {
    Delivered,
    Clicked,
    Dismissed,
}

/// A raw activity sample. Append-only, pruned after 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySample {
    pub user_id: String,
    /// Seconds between an assistant message and the user's reply.
    pub response_latency_secs: Option<f64>,
    pub at: DateTime<Utc>,
}

/// Rolling per-(user, hour, weekday) activity aggregate.
/// Updated incrementally on every sample, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPattern {
    pub user_id: String,
    /// Hour of day 0–23 (user-local).
    pub hour: u8,
    /// Weekday 0–6, Monday = 0 (user-local).
    pub weekday: u8,
    /// Rolling mean messages per sample slot.
    pub avg_messages: f64,
    /// Rolling mean response latency in seconds.
    pub avg_latency_secs: Option<f64>,
    /// Derived flow score from the recompute pass.
    pub flow_score: f64,
    pub sample_count: u32,
}

/// Per-user manual focus override. Auto-expires when read past `until`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOverride {
    pub user_id: String,
    pub is_focusing: bool,
    pub until: DateTime<Utc>,
}

/// Fused flow score for a user at a moment in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowScore {
    /// 0–100, higher = deeper focus.
    pub score: u8,
    pub in_flow: bool,
    pub deep_flow: bool,
    /// "computed" or "manual_override".
    pub source: String,
    pub components: FlowComponents,
    /// Best-effort flow end estimate (override expiry when overridden).
    pub estimated_end: Option<DateTime<Utc>>,
}

/// Component breakdown of a computed flow score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowComponents {
    pub activity: f64,
    pub response: f64,
    pub historical: f64,
}

/// Quiet-hours membership for a user right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietStatus {
    pub in_quiet_hours: bool,
    /// When the current quiet window ends, if inside one.
    pub ends_at: Option<DateTime<Utc>>,
}

impl QuietStatus {
    pub fn clear() -> Self {
        Self { in_quiet_hours: false, ends_at: None }
    }
}

/// Advisory rate-limit check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub sent_this_hour: u32,
    pub limit: u32,
    /// When capacity frees up, if currently capped.
    pub reset_at: Option<DateTime<Utc>>,
}

/// The admission gate's verdict for one notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub can_send: bool,
    pub reason: Option<BlockReason>,
    /// When to try again. None with a block reason means never (or re-poll).
    pub retry_at: Option<DateTime<Utc>>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self { can_send: true, reason: None, retry_at: None }
    }

    pub fn block(reason: BlockReason, retry_at: Option<DateTime<Utc>>) -> Self {
        Self { can_send: false, reason: Some(reason), retry_at }
    }
}

/// Why the admission gate refused to send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Disabled,
    QuietHours,
    FlowState,
    RateLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::QuietHours => "quiet_hours",
            Self::FlowState => "flow_state",
            Self::RateLimit => "rate_limit",
        }
    }
}

/// Counters for one `process_queue` cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProcessReport {
    pub processed: u32,
    pub sent: u32,
    pub batched: u32,
    pub suppressed: u32,
    pub expired: u32,
    pub errors: u32,
}
