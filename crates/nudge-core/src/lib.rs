//! # Nudge Core
//!
//! Shared foundation for the Nudge notification pipeline: the data model
//! (notifications, subscriptions, delivery log), the error taxonomy, the
//! configuration system, user preferences, and the collaborator traits
//! the pipeline is wired with (push transport, subscription registry,
//! flow signal source, delivery service).
//!
//! Everything that crosses a crate boundary in the pipeline lives here so
//! the queue, flow, and push crates stay decoupled from each other.

pub mod config;
pub mod error;
pub mod prefs;
pub mod traits;
pub mod types;

pub use config::NudgeConfig;
pub use error::{NudgeError, Result};
pub use prefs::{CategoryOverride, CategoryPolicy, PreferencesStore, UserPreferences};
pub use traits::{
    DeliveryReport, DeliveryService, FlowSignalSource, NeutralFlow, PushTransport,
    SubscriptionRegistry, TransportReply,
};
pub use types::{
    AdmissionDecision, BlockReason, DeliveryEvent, DeliveryLogEntry, DeliveryStatus, FlowComponents,
    FlowOverride, FlowScore, Notification, NotificationStatus, ProcessReport, PushPayload,
    PushSubscription, QuietStatus, RateLimitStatus,
};
