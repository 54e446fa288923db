//! Per-user delivery rate limiting over a trailing one-hour window.
//!
//! Advisory read-then-decide: no lock is held between the check and the
//! send, so a brief overshoot under heavy concurrency is possible and
//! accepted — it self-corrects on the next window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use nudge_core::error::Result;
use nudge_core::prefs::UserPreferences;
use nudge_core::types::RateLimitStatus;

use crate::store::QueueDb;

pub struct RateLimiter {
    db: Arc<QueueDb>,
}

impl RateLimiter {
    pub fn new(db: Arc<QueueDb>) -> Self {
        Self { db }
    }

    /// Count deliveries in the trailing hour against the user's cap.
    pub fn check(
        &self,
        prefs: &UserPreferences,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus> {
        let limit = prefs.max_notifications_per_hour;
        let sent_this_hour = self.db.deliveries_since(user_id, now - Duration::minutes(60))?;

        if sent_this_hour >= limit {
            let reset_at = now + Duration::minutes(prefs.cooldown_after_burst_mins as i64);
            return Ok(RateLimitStatus {
                allowed: false,
                sent_this_hour,
                limit,
                reset_at: Some(reset_at),
            });
        }
        Ok(RateLimitStatus { allowed: true, sent_this_hour, limit, reset_at: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::types::{DeliveryLogEntry, Notification};

    fn setup(name: &str) -> (RateLimiter, Arc<QueueDb>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("nudge-test-rate-{name}.db"));
        std::fs::remove_file(&path).ok();
        let db = Arc::new(QueueDb::open(&path).unwrap());
        (RateLimiter::new(db.clone()), db, path)
    }

    fn delivered(db: &QueueDb, user: &str) {
        let n = Notification::new(user, "task_reminder", "t", "b", 5);
        db.insert(&n).unwrap();
        db.insert_log(&DeliveryLogEntry::sent(&n.id, "sub1")).unwrap();
    }

    #[test]
    fn under_the_cap_is_allowed() {
        let (limiter, db, path) = setup("under");
        for _ in 0..5 {
            delivered(&db, "u1");
        }
        let status = limiter.check(&UserPreferences::default(), "u1", Utc::now()).unwrap();
        assert!(status.allowed);
        assert_eq!(status.sent_this_hour, 5);
        assert_eq!(status.limit, 6);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn at_the_cap_is_blocked_with_cooldown() {
        let (limiter, db, path) = setup("capped");
        for _ in 0..6 {
            delivered(&db, "u1");
        }
        let now = Utc::now();
        let status = limiter.check(&UserPreferences::default(), "u1", now).unwrap();
        assert!(!status.allowed);
        assert_eq!(status.sent_this_hour, 6);
        assert_eq!(status.reset_at.unwrap() - now, Duration::minutes(30));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn other_users_do_not_count() {
        let (limiter, db, path) = setup("isolated");
        for _ in 0..10 {
            delivered(&db, "noisy");
        }
        let status = limiter.check(&UserPreferences::default(), "quiet", Utc::now()).unwrap();
        assert!(status.allowed);
        assert_eq!(status.sent_this_hour, 0);
        std::fs::remove_file(&path).ok();
    }
}
