//! # Nudge Push
//!
//! Push delivery for the Nudge pipeline: the durable subscription
//! registry, the webhook transport, and the retrying executor that fans a
//! payload out to every active device.
//!
//! The queue crate only ever sees the [`DeliveryService`] trait from
//! `nudge-core`; this crate provides the production implementation.
//!
//! [`DeliveryService`]: nudge_core::traits::DeliveryService

pub mod executor;
pub mod registry;
pub mod transport;

pub use executor::DeliveryExecutor;
pub use registry::SubscriptionDb;
pub use transport::WebhookTransport;
