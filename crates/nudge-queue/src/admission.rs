//! Admission gate — the composite "can this be sent right now" decision.
//!
//! Checks run in strict order and the first blocking reason wins:
//! preferences disabled, quiet hours, flow state, rate limit. Priority 9+
//! bypasses quiet hours only; categories that cannot be suppressed skip
//! the flow check regardless of priority.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use nudge_core::error::Result;
use nudge_core::prefs::PreferencesStore;
use nudge_core::traits::FlowSignalSource;
use nudge_core::types::{AdmissionDecision, BlockReason};

use crate::quiet::evaluate_quiet_hours;
use crate::ratelimit::RateLimiter;

/// Priority at or above which quiet hours no longer apply.
const QUIET_HOURS_BYPASS_PRIORITY: u8 = 9;

pub struct AdmissionGate {
    prefs: Arc<dyn PreferencesStore>,
    flow: Arc<dyn FlowSignalSource>,
    limiter: RateLimiter,
}

impl AdmissionGate {
    pub fn new(
        prefs: Arc<dyn PreferencesStore>,
        flow: Arc<dyn FlowSignalSource>,
        limiter: RateLimiter,
    ) -> Self {
        Self { prefs, flow, limiter }
    }

    /// Decide whether a notification with this (user, priority, category)
    /// may be delivered at `now`.
    pub async fn can_send_now(
        &self,
        user_id: &str,
        priority: u8,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision> {
        let prefs = self.prefs.get(user_id);
        let policy = prefs.category_policy(category);

        // 1. Globally or per-category disabled — blocked for good.
        if !prefs.enabled || !policy.enabled {
            return Ok(AdmissionDecision::block(BlockReason::Disabled, None));
        }

        // 2. Quiet hours, unless the priority is urgent enough to wake.
        if priority < QUIET_HOURS_BYPASS_PRIORITY {
            let quiet = evaluate_quiet_hours(&prefs, now);
            if quiet.in_quiet_hours {
                return Ok(AdmissionDecision::block(BlockReason::QuietHours, quiet.ends_at));
            }
        }

        // 3. Flow state. Categories with can_suppress=false skip this
        //    entirely; otherwise only priorities below the interrupt
        //    threshold defer to flow.
        if policy.respect_flow_state
            && policy.can_suppress
            && priority < prefs.flow_interrupt_threshold
        {
            let flow = self.flow.score(user_id).await?;
            if flow.in_flow {
                // Best-effort retry hint; None means the caller re-polls.
                return Ok(AdmissionDecision::block(BlockReason::FlowState, flow.estimated_end));
            }
        }

        // 4. Hourly rate cap.
        let rate = self.limiter.check(&prefs, user_id, now)?;
        if !rate.allowed {
            return Ok(AdmissionDecision::block(BlockReason::RateLimit, rate.reset_at));
        }

        Ok(AdmissionDecision::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nudge_core::prefs::UserPreferences;
    use nudge_core::traits::NeutralFlow;
    use nudge_core::types::{DeliveryLogEntry, FlowComponents, FlowScore, Notification};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::store::QueueDb;

    /// In-memory preferences store for gate tests.
    struct MemPrefs {
        map: Mutex<HashMap<String, UserPreferences>>,
    }

    impl MemPrefs {
        fn with(user: &str, prefs: UserPreferences) -> Arc<Self> {
            let mut map = HashMap::new();
            map.insert(user.to_string(), prefs);
            Arc::new(Self { map: Mutex::new(map) })
        }
    }

    impl PreferencesStore for MemPrefs {
        fn get(&self, user_id: &str) -> UserPreferences {
            self.map.lock().unwrap().get(user_id).cloned().unwrap_or_default()
        }
        fn set(&self, user_id: &str, prefs: &UserPreferences) -> Result<()> {
            self.map.lock().unwrap().insert(user_id.to_string(), prefs.clone());
            Ok(())
        }
    }

    /// Flow source pinned to "in flow".
    struct AlwaysInFlow;

    #[async_trait]
    impl FlowSignalSource for AlwaysInFlow {
        async fn score(&self, _user_id: &str) -> Result<FlowScore> {
            Ok(FlowScore {
                score: 95,
                in_flow: true,
                deep_flow: true,
                source: "computed".into(),
                components: FlowComponents::default(),
                estimated_end: None,
            })
        }
    }

    fn queue_db(name: &str) -> (Arc<QueueDb>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("nudge-test-gate-{name}.db"));
        std::fs::remove_file(&path).ok();
        (Arc::new(QueueDb::open(&path).unwrap()), path)
    }

    fn quiet_prefs() -> UserPreferences {
        UserPreferences {
            quiet_hours_start: Some("00:00".into()),
            quiet_hours_end: Some("23:59".into()),
            ..UserPreferences::default()
        }
    }

    #[tokio::test]
    async fn disabled_blocks_without_retry() {
        let (db, path) = queue_db("disabled");
        let prefs = UserPreferences { enabled: false, ..UserPreferences::default() };
        let gate = AdmissionGate::new(
            MemPrefs::with("u1", prefs),
            Arc::new(NeutralFlow),
            RateLimiter::new(db),
        );
        let d = gate.can_send_now("u1", 10, "task_reminder", Utc::now()).await.unwrap();
        assert!(!d.can_send);
        assert_eq!(d.reason, Some(BlockReason::Disabled));
        assert!(d.retry_at.is_none());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn priority_nine_bypasses_quiet_hours() {
        let (db, path) = queue_db("bypass");
        let gate = AdmissionGate::new(
            MemPrefs::with("u1", quiet_prefs()),
            Arc::new(NeutralFlow),
            RateLimiter::new(db),
        );
        for p in 9..=10 {
            let d = gate.can_send_now("u1", p, "commitment_due", Utc::now()).await.unwrap();
            assert_ne!(d.reason, Some(BlockReason::QuietHours), "priority {p}");
        }
        // Below 9 the same window blocks.
        let d = gate.can_send_now("u1", 8, "task_reminder", Utc::now()).await.unwrap();
        assert_eq!(d.reason, Some(BlockReason::QuietHours));
        assert!(d.retry_at.is_some());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn flow_blocks_low_priority_only() {
        let (db, path) = queue_db("flow");
        let gate = AdmissionGate::new(
            MemPrefs::with("u1", UserPreferences::default()),
            Arc::new(AlwaysInFlow),
            RateLimiter::new(db),
        );
        let d = gate.can_send_now("u1", 5, "task_reminder", Utc::now()).await.unwrap();
        assert_eq!(d.reason, Some(BlockReason::FlowState));
        // At the interrupt threshold (default 8) flow no longer blocks.
        let d = gate.can_send_now("u1", 8, "task_reminder", Utc::now()).await.unwrap();
        assert!(d.can_send);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn unsuppressable_category_ignores_flow() {
        let (db, path) = queue_db("unsuppressable");
        let gate = AdmissionGate::new(
            MemPrefs::with("u1", UserPreferences::default()),
            Arc::new(AlwaysInFlow),
            RateLimiter::new(db),
        );
        let d = gate.can_send_now("u1", 1, "commitment_due", Utc::now()).await.unwrap();
        assert!(d.can_send);
        assert_ne!(d.reason, Some(BlockReason::FlowState));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn rate_limit_is_checked_last() {
        let (db, path) = queue_db("rate");
        for _ in 0..6 {
            let n = Notification::new("u1", "task_reminder", "t", "b", 5);
            db.insert(&n).unwrap();
            db.insert_log(&DeliveryLogEntry::sent(&n.id, "sub1")).unwrap();
        }
        let gate = AdmissionGate::new(
            MemPrefs::with("u1", UserPreferences::default()),
            Arc::new(NeutralFlow),
            RateLimiter::new(db),
        );
        let d = gate.can_send_now("u1", 10, "task_reminder", Utc::now()).await.unwrap();
        assert!(!d.can_send);
        assert_eq!(d.reason, Some(BlockReason::RateLimit));
        assert!(d.retry_at.is_some());
        std::fs::remove_file(&path).ok();
    }
}
