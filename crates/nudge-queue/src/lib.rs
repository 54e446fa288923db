//! # Nudge Queue
//!
//! The orchestrating core of the notification pipeline: owns the
//! notification lifecycle, decides *whether* and *when* each queued item
//! may be delivered (quiet hours, flow state, rate limits), folds related
//! low-priority items into batch summaries, and hands admitted items to
//! the injected delivery service.
//!
//! ## Data flow
//! ```text
//! enqueue() → notifications table (pending/scheduled)
//!   scan cycle (process_queue):
//!     expired?      → expired
//!     batchable?    → batched (held until the window closes)
//!     admission     → send now | reschedule | suppress
//!     atomic claim  → sending   (loser of the race skips silently)
//!     delivery      → sent | failed  + delivery_log rows
//! ```

pub mod admission;
pub mod batch;
pub mod queue;
pub mod quiet;
pub mod ratelimit;
pub mod store;

pub use admission::AdmissionGate;
pub use batch::{BatchSummary, build_summary, should_batch, window_expired};
pub use queue::{EnqueueRequest, NotificationQueue};
pub use quiet::evaluate_quiet_hours;
pub use ratelimit::RateLimiter;
pub use store::QueueDb;
