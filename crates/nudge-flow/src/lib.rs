//! # Nudge Flow
//!
//! Infers whether a user is in a focused "flow" state from recent
//! activity density, response latency, and learned hour-of-week patterns,
//! and lets the user pin the answer with a manual focus override.
//!
//! The queue crate consumes this through the `FlowSignalSource` trait;
//! nothing here knows about notifications.

pub mod recompute;
pub mod scorer;
pub mod store;

pub use recompute::{recompute_patterns, spawn_recompute};
pub use scorer::FlowScorer;
pub use store::FlowDb;
