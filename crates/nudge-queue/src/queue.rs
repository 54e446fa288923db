//! Notification queue orchestration — lifecycle, scan cycle, dispatch.
//!
//! One logical worker scans per queue shard. Concurrency safety comes
//! from the store's conditional claims: losing a claim means another
//! cycle took the row, and the loser moves on silently.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;

use nudge_core::error::{NudgeError, Result};
use nudge_core::prefs::PreferencesStore;
use nudge_core::traits::{DeliveryService, FlowSignalSource};
use nudge_core::types::{
    BlockReason, DeliveryEvent, DeliveryLogEntry, Notification, NotificationStatus, ProcessReport,
    PushPayload,
};

use crate::admission::AdmissionGate;
use crate::batch::{self, BatchSummary};
use crate::ratelimit::RateLimiter;
use crate::store::QueueDb;

/// Fallback reschedule delay when a block gives no retry hint (e.g. flow
/// state with no estimated end) — the next scans re-poll.
const REPOLL_DELAY_MINS: i64 = 5;

/// A claimed notification ready to hand to the delivery service. Jobs
/// are collected during the scan and dispatched together so one slow
/// endpoint cannot hold up another user's delivery.
struct DispatchJob {
    notification: Notification,
    payload: PushPayload,
    /// Other members of a flushed batch; they share the anchor's fate.
    batch_members: Vec<String>,
}

/// What a producer hands to `enqueue`. Only the write entry point into
/// this core from outside.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub user_id: String,
    pub category: String,
    pub title: String,
    pub body: String,
    /// None uses the category's default priority.
    pub priority: Option<u8>,
    pub batch_key: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(user_id: &str, category: &str, title: &str, body: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            category: category.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            priority: None,
            batch_key: None,
            scheduled_for: None,
            expires_at: None,
        }
    }
}

/// The orchestrator: owns notification lifecycle state and drives each
/// item through batching, admission, and delivery.
pub struct NotificationQueue {
    db: Arc<QueueDb>,
    prefs: Arc<dyn PreferencesStore>,
    gate: AdmissionGate,
    delivery: Arc<dyn DeliveryService>,
}

impl NotificationQueue {
    pub fn new(
        db: Arc<QueueDb>,
        prefs: Arc<dyn PreferencesStore>,
        flow: Arc<dyn FlowSignalSource>,
        delivery: Arc<dyn DeliveryService>,
    ) -> Self {
        let gate = AdmissionGate::new(prefs.clone(), flow, RateLimiter::new(db.clone()));
        Self { db, prefs, gate, delivery }
    }

    /// Accept a new notification. Configuration problems degrade to
    /// defaults — enqueue itself never blocks on preferences.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<String> {
        if req.user_id.is_empty() {
            return Err(NudgeError::Invalid("enqueue requires a user id".into()));
        }
        let prefs = self.prefs.get(&req.user_id);
        let policy = prefs.category_policy(&req.category);

        let mut n = Notification::new(
            &req.user_id,
            &req.category,
            &req.title,
            &req.body,
            req.priority.unwrap_or(policy.default_priority),
        );
        n.priority = n.priority.max(policy.min_priority);
        n.batch_key = req.batch_key;
        n.scheduled_for = req.scheduled_for;
        n.expires_at = req.expires_at;
        if req.scheduled_for.is_some_and(|at| at > Utc::now()) {
            n.status = NotificationStatus::Scheduled;
        }

        self.db.insert(&n)?;
        tracing::debug!("📨 Enqueued {} ({}, p{}) for {}", n.id, n.category, n.priority, n.user_id);
        Ok(n.id)
    }

    /// Undelivered notifications for a user.
    pub fn get_pending(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.db.pending_for_user(user_id)
    }

    /// Recent notification history for a user, newest first.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        self.db.recent(user_id, limit)
    }

    /// Cancel a not-yet-claimed notification. Returns false if it was
    /// already in flight or terminal.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let cancelled = self.db.cancel(id)?;
        if cancelled {
            tracing::info!("🚫 Cancelled notification {id}");
        }
        Ok(cancelled)
    }

    /// Apply a client/webhook delivery event to the log and the owning
    /// notification. Returns false for an unknown delivery ID.
    pub fn record_delivery_event(&self, delivery_id: &str, event: DeliveryEvent) -> Result<bool> {
        match self.db.record_event(delivery_id, event, Utc::now())? {
            Some(entry) => {
                self.db.advance_status(&entry.notification_id, event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One scan cycle: examine up to `limit` due items and drive each to
    /// its next state. Invoked by an external periodic trigger.
    pub async fn process_queue(&self, limit: usize) -> Result<ProcessReport> {
        let now = Utc::now();
        let candidates = self.db.scan_candidates(limit, now)?;
        let mut report = ProcessReport::default();
        let mut handled: HashSet<String> = HashSet::new();
        let mut jobs: Vec<DispatchJob> = Vec::new();

        for n in candidates {
            if handled.contains(&n.id) {
                continue;
            }
            report.processed += 1;

            if n.is_expired(now) {
                if self.db.mark_expired(&n.id)? {
                    report.expired += 1;
                    tracing::debug!("⌛ Notification {} expired before delivery", n.id);
                }
                continue;
            }

            match n.status {
                NotificationStatus::Batched => {
                    if let Some(job) =
                        self.process_batch_group(&n, now, &mut handled, &mut report).await?
                    {
                        jobs.push(job);
                    }
                }
                NotificationStatus::Pending | NotificationStatus::Scheduled => {
                    if let Some(job) = self.process_standalone(&n, now, &mut report).await? {
                        jobs.push(job);
                    }
                }
                // Scan shouldn't return anything else; skip defensively.
                _ => {}
            }
        }

        // All claims are already taken, so the deliveries can run
        // concurrently: one user's retry backoff never delays another's
        // send.
        for outcome in join_all(jobs.into_iter().map(|job| self.dispatch(job))).await {
            if outcome? {
                report.sent += 1;
            } else {
                report.errors += 1;
            }
        }

        if report.processed > 0 {
            tracing::info!(
                "📬 Queue cycle: {} processed, {} sent, {} batched, {} suppressed, {} expired, {} errors",
                report.processed, report.sent, report.batched,
                report.suppressed, report.expired, report.errors
            );
        }
        Ok(report)
    }

    /// Drive one pending/scheduled notification: hold for batch, block,
    /// or claim it and return the dispatch job.
    async fn process_standalone(
        &self,
        n: &Notification,
        now: DateTime<Utc>,
        report: &mut ProcessReport,
    ) -> Result<Option<DispatchJob>> {
        let prefs = self.prefs.get(&n.user_id);
        let policy = prefs.category_policy(&n.category);

        if batch::should_batch(n, &policy) {
            let window = n.batch_window_secs.unwrap_or(prefs.batch_window_secs);
            if self.db.mark_batched(&n.id, window)? {
                report.batched += 1;
            }
            return Ok(None);
        }

        let decision = self.gate.can_send_now(&n.user_id, n.priority, &n.category, now).await?;
        if !decision.can_send {
            self.apply_block(&n.id, decision.reason, decision.retry_at, now, report)?;
            return Ok(None);
        }

        // Atomic claim — losing the race is a silent skip.
        if !self.db.claim(&n.id, n.status)? {
            return Ok(None);
        }

        Ok(Some(DispatchJob {
            payload: PushPayload::from_notification(n),
            notification: n.clone(),
            batch_members: Vec::new(),
        }))
    }

    /// Evaluate a held batch: flush it when the window has closed.
    async fn process_batch_group(
        &self,
        seed: &Notification,
        now: DateTime<Utc>,
        handled: &mut HashSet<String>,
        report: &mut ProcessReport,
    ) -> Result<Option<DispatchJob>> {
        let Some(batch_key) = seed.batch_key.as_deref() else {
            // A batched row without a key cannot be grouped; fail it out
            // rather than rescan forever.
            self.db.mark_failed(&seed.id, "batched without a batch key")?;
            report.errors += 1;
            return Ok(None);
        };

        let all_members = self.db.batch_members(&seed.user_id, batch_key)?;
        for m in &all_members {
            handled.insert(m.id.clone());
        }

        // A member can outlive its expiry while held; it must drop out of
        // the summary, never be delivered.
        let mut members = Vec::new();
        for m in all_members {
            if m.is_expired(now) {
                if self.db.mark_expired(&m.id)? {
                    report.expired += 1;
                    tracing::debug!("⌛ Batch member {} expired while held", m.id);
                }
            } else {
                members.push(m);
            }
        }
        if members.is_empty() {
            return Ok(None);
        }

        let prefs = self.prefs.get(&seed.user_id);
        let oldest = &members[0]; // batch_members returns oldest first
        let window = oldest.batch_window_secs.unwrap_or(prefs.batch_window_secs);
        if !batch::window_expired(oldest.created_at, window, now) {
            return Ok(None);
        }

        let summary = batch::build_summary(&members);
        let decision = self
            .gate
            .can_send_now(&seed.user_id, summary.priority, &seed.category, now)
            .await?;
        if !decision.can_send {
            if decision.reason == Some(BlockReason::Disabled) {
                for m in &members {
                    self.db.suppress(&m.id)?;
                }
                report.suppressed += members.len() as u32;
            }
            // Otherwise leave the batch held; the next cycle re-evaluates.
            return Ok(None);
        }

        if !self.db.claim_batch(&summary.notification_ids)? {
            return Ok(None); // another worker is flushing this batch
        }

        if members.len() == 1 {
            // A batch of one flushes as the original notification.
            return Ok(Some(DispatchJob {
                payload: PushPayload::from_notification(oldest),
                notification: oldest.clone(),
                batch_members: Vec::new(),
            }));
        }

        let anchor = self.anchor_for(&summary, oldest);
        let payload = PushPayload {
            title: summary.title.clone(),
            body: summary.body.clone(),
            icon: None,
            action_url: None,
            tag: Some(summary.batch_key.clone()),
        };
        let others: Vec<String> = summary
            .notification_ids
            .iter()
            .filter(|id| **id != anchor.id)
            .cloned()
            .collect();

        tracing::info!(
            "📦 Flushing batch {}/{} with {} members",
            seed.user_id, batch_key, members.len()
        );
        Ok(Some(DispatchJob { notification: anchor, payload, batch_members: others }))
    }

    /// The summary delivers under the oldest member's identity so its
    /// delivery log rows have a real notification to hang off.
    fn anchor_for(&self, summary: &BatchSummary, oldest: &Notification) -> Notification {
        let mut anchor = oldest.clone();
        anchor.title = summary.title.clone();
        anchor.body = summary.body.clone();
        anchor.priority = summary.priority;
        anchor
    }

    /// Hand a claimed job to the delivery service and settle the outcome.
    /// Returns true when the notification went out to at least one
    /// subscription.
    async fn dispatch(&self, job: DispatchJob) -> Result<bool> {
        let n = &job.notification;
        let batch_members = &job.batch_members;
        let outcome = self.delivery.deliver(n, &job.payload).await;
        let now = Utc::now();

        match outcome {
            Ok(delivery) => {
                for entry in &delivery.entries {
                    self.db.insert_log(entry)?;
                }
                if delivery.any_success() {
                    self.settle(n, batch_members, NotificationStatus::Sent, now, None)?;
                    for member_id in batch_members {
                        self.db.insert_log(&DeliveryLogEntry::batched(member_id))?;
                    }
                    tracing::info!(
                        "✅ Sent {} to {}/{} subscriptions",
                        n.id,
                        delivery.successful,
                        delivery.successful + delivery.failed
                    );
                    Ok(true)
                } else {
                    let reason = if delivery.entries.is_empty() {
                        "no active subscriptions".to_string()
                    } else {
                        format!("all {} subscriptions failed", delivery.failed)
                    };
                    self.settle(n, batch_members, NotificationStatus::Failed, now, Some(&reason))?;
                    tracing::warn!("⚠️ Delivery of {} failed: {reason}", n.id);
                    Ok(false)
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.settle(n, batch_members, NotificationStatus::Failed, now, Some(&reason))?;
                tracing::warn!("⚠️ Delivery of {} errored: {reason}", n.id);
                Ok(false)
            }
        }
    }

    /// Move a dispatched notification (and any batch members) to its
    /// terminal state. Batch members land atomically with a shared
    /// `sent_at`.
    fn settle(
        &self,
        n: &Notification,
        batch_members: &[String],
        status: NotificationStatus,
        now: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        if batch_members.is_empty() {
            match status {
                NotificationStatus::Sent => self.db.mark_sent(&n.id, now),
                _ => self.db.mark_failed(&n.id, error.unwrap_or("delivery failed")),
            }
        } else {
            let all_ids: Vec<String> = std::iter::once(n.id.clone())
                .chain(batch_members.iter().cloned())
                .collect();
            self.db.finalize_batch(&all_ids, status, now, error)
        }
    }

    /// Settle a blocked notification: suppress for good, or push to the
    /// retry time.
    fn apply_block(
        &self,
        id: &str,
        reason: Option<BlockReason>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut ProcessReport,
    ) -> Result<()> {
        match reason {
            Some(BlockReason::Disabled) => {
                if self.db.suppress(id)? {
                    report.suppressed += 1;
                }
            }
            Some(r) => {
                let at = retry_at.unwrap_or(now + Duration::minutes(REPOLL_DELAY_MINS));
                if self.db.reschedule(id, at)? {
                    report.suppressed += 1;
                    tracing::debug!("💤 {} blocked by {}, retrying at {at}", id, r.as_str());
                }
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nudge_core::prefs::UserPreferences;
    use nudge_core::traits::{DeliveryReport, NeutralFlow};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Delivery service that succeeds or fails on command and records
    /// what it was asked to send.
    struct ScriptedDelivery {
        succeed: bool,
        sent: Mutex<Vec<(String, PushPayload)>>,
    }

    impl ScriptedDelivery {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self { succeed, sent: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl DeliveryService for ScriptedDelivery {
        async fn deliver(
            &self,
            n: &Notification,
            payload: &PushPayload,
        ) -> Result<DeliveryReport> {
            self.sent.lock().unwrap().push((n.id.clone(), payload.clone()));
            if self.succeed {
                Ok(DeliveryReport {
                    successful: 1,
                    failed: 0,
                    entries: vec![DeliveryLogEntry::sent(&n.id, "sub1")],
                })
            } else {
                Ok(DeliveryReport {
                    successful: 0,
                    failed: 1,
                    entries: vec![DeliveryLogEntry::failed(&n.id, "sub1", "endpoint down")],
                })
            }
        }
    }

    struct MemPrefs {
        map: Mutex<HashMap<String, UserPreferences>>,
    }

    impl MemPrefs {
        fn empty() -> Arc<Self> {
            Arc::new(Self { map: Mutex::new(HashMap::new()) })
        }
        fn with(user: &str, prefs: UserPreferences) -> Arc<Self> {
            let store = Self::empty();
            store.map.lock().unwrap().insert(user.to_string(), prefs);
            store
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

    fn queue(
        name: &str,
        prefs: Arc<MemPrefs>,
        delivery: Arc<ScriptedDelivery>,
    ) -> (NotificationQueue, Arc<QueueDb>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("nudge-test-nq-{name}.db"));
        std::fs::remove_file(&path).ok();
        let db = Arc::new(QueueDb::open(&path).unwrap());
        let q = NotificationQueue::new(db.clone(), prefs, Arc::new(NeutralFlow), delivery);
        (q, db, path)
    }

    #[tokio::test]
    async fn enqueue_then_process_sends() {
        let delivery = ScriptedDelivery::new(true);
        let (q, db, path) = queue("send", MemPrefs::empty(), delivery.clone());

        let id = q.enqueue(EnqueueRequest::new("u1", "system", "Hello", "World")).unwrap();
        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.errors, 0);

        let n = db.get(&id).unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert!(n.sent_at.is_some());
        assert_eq!(db.log_for_notification(&id).unwrap().len(), 1);
        assert_eq!(delivery.sent.lock().unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn failed_delivery_is_kept_with_reason() {
        let (q, db, path) = queue("fail", MemPrefs::empty(), ScriptedDelivery::new(false));
        let id = q.enqueue(EnqueueRequest::new("u1", "system", "Hello", "World")).unwrap();
        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.errors, 1);

        let n = db.get(&id).unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert!(n.error.as_deref().unwrap().contains("failed"));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn expired_items_are_never_delivered() {
        let delivery = ScriptedDelivery::new(true);
        let (q, db, path) = queue("expire", MemPrefs::empty(), delivery.clone());
        let mut req = EnqueueRequest::new("u1", "system", "Old", "news");
        req.expires_at = Some(Utc::now() - Duration::minutes(1));
        let id = q.enqueue(req).unwrap();

        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(db.get(&id).unwrap().unwrap().status, NotificationStatus::Expired);
        assert!(delivery.sent.lock().unwrap().is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn disabled_user_suppresses() {
        let prefs = MemPrefs::with("u1", UserPreferences { enabled: false, ..Default::default() });
        let (q, db, path) = queue("suppress", prefs, ScriptedDelivery::new(true));
        let id = q.enqueue(EnqueueRequest::new("u1", "system", "Psst", "hey")).unwrap();

        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.suppressed, 1);
        assert_eq!(db.get(&id).unwrap().unwrap().status, NotificationStatus::Suppressed);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn quiet_hours_reschedule_to_window_end() {
        let prefs = MemPrefs::with(
            "u1",
            UserPreferences {
                quiet_hours_start: Some("00:00".into()),
                quiet_hours_end: Some("23:59".into()),
                ..Default::default()
            },
        );
        let (q, db, path) = queue("quiet", prefs, ScriptedDelivery::new(true));
        let id = q.enqueue(EnqueueRequest::new("u1", "task_reminder", "Later", "please")).unwrap();

        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.suppressed, 1);
        let n = db.get(&id).unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Scheduled);
        assert!(n.scheduled_for.unwrap() > Utc::now());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn batch_holds_then_flushes_atomically() {
        let delivery = ScriptedDelivery::new(true);
        let (q, db, path) = queue("batch", MemPrefs::empty(), delivery.clone());

        // Three related low-priority reminders, the oldest 6 minutes old.
        let mut ids = Vec::new();
        for (title, age) in [("Water plants", 360), ("Reply to Dana", 240), ("Stretch", 120)] {
            let mut n = Notification::new("u1", "task_reminder", title, "b", 3);
            n.batch_key = Some("task_reminder".into());
            n.batch_window_secs = Some(300);
            n.created_at = Utc::now() - Duration::seconds(age);
            db.insert(&n).unwrap();
            ids.push(n.id);
        }

        // First cycle holds them for batching.
        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.batched, 3);
        assert_eq!(report.sent, 0);

        // Second cycle: window (anchored at the oldest) has closed.
        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.sent, 1);

        // All members share a terminal status and sent_at.
        let first = db.get(&ids[0]).unwrap().unwrap();
        for id in &ids {
            let n = db.get(id).unwrap().unwrap();
            assert_eq!(n.status, NotificationStatus::Sent);
            assert_eq!(n.sent_at, first.sent_at);
        }

        // Exactly one summary went out, mentioning all three.
        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.title.contains('3'));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn expired_batch_members_drop_out_of_the_flush() {
        let delivery = ScriptedDelivery::new(true);
        let (q, db, path) = queue("batch-expiry", MemPrefs::empty(), delivery.clone());

        // Two held members past their window; the younger one expired
        // while waiting.
        let mut keep = Notification::new("u1", "task_reminder", "Keep me", "b", 3);
        keep.batch_key = Some("task_reminder".into());
        keep.created_at = Utc::now() - Duration::seconds(360);
        db.insert(&keep).unwrap();
        db.mark_batched(&keep.id, 300).unwrap();

        let mut stale = Notification::new("u1", "task_reminder", "I am expired", "b", 3);
        stale.batch_key = Some("task_reminder".into());
        stale.created_at = Utc::now() - Duration::seconds(120);
        stale.expires_at = Some(Utc::now() - Duration::seconds(1));
        db.insert(&stale).unwrap();
        db.mark_batched(&stale.id, 300).unwrap();

        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.sent, 1);

        assert_eq!(db.get(&stale.id).unwrap().unwrap().status, NotificationStatus::Expired);
        assert_eq!(db.get(&keep.id).unwrap().unwrap().status, NotificationStatus::Sent);

        // The survivor went out alone, and the expired title never left.
        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.title, "Keep me");
        assert!(!sent[0].1.body.contains("expired"));
        std::fs::remove_file(&path).ok();
    }

    /// Delivery that only resolves once both calls are in flight, so a
    /// serialized dispatch loop would hang here.
    struct ParallelDelivery {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl DeliveryService for ParallelDelivery {
        async fn deliver(
            &self,
            n: &Notification,
            _payload: &PushPayload,
        ) -> Result<DeliveryReport> {
            self.barrier.wait().await;
            Ok(DeliveryReport {
                successful: 1,
                failed: 0,
                entries: vec![DeliveryLogEntry::sent(&n.id, "sub1")],
            })
        }
    }

    #[tokio::test]
    async fn one_slow_delivery_does_not_stall_another_user() {
        let path = std::env::temp_dir().join("nudge-test-nq-parallel.db");
        std::fs::remove_file(&path).ok();
        let db = Arc::new(QueueDb::open(&path).unwrap());
        let delivery = Arc::new(ParallelDelivery { barrier: tokio::sync::Barrier::new(2) });
        let q = NotificationQueue::new(
            db.clone(),
            MemPrefs::empty(),
            Arc::new(NeutralFlow),
            delivery,
        );

        q.enqueue(EnqueueRequest::new("u1", "system", "One", "b")).unwrap();
        q.enqueue(EnqueueRequest::new("u2", "system", "Two", "b")).unwrap();

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            q.process_queue(10),
        )
        .await
        .expect("deliveries must overlap instead of running one by one")
        .unwrap();
        assert_eq!(report.sent, 2);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn cancelled_item_is_skipped() {
        let delivery = ScriptedDelivery::new(true);
        let (q, _db, path) = queue("cancel", MemPrefs::empty(), delivery.clone());
        let id = q.enqueue(EnqueueRequest::new("u1", "system", "Nope", "never mind")).unwrap();
        assert!(q.cancel(&id).unwrap());
        assert!(!q.cancel(&id).unwrap());

        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(delivery.sent.lock().unwrap().is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn delivery_events_advance_the_lifecycle() {
        let (q, db, path) = queue("events", MemPrefs::empty(), ScriptedDelivery::new(true));
        let id = q.enqueue(EnqueueRequest::new("u1", "system", "Hi", "there")).unwrap();
        q.process_queue(10).await.unwrap();

        let delivery_id = db.log_for_notification(&id).unwrap()[0].id.clone();
        assert!(q.record_delivery_event(&delivery_id, DeliveryEvent::Delivered).unwrap());
        assert_eq!(db.get(&id).unwrap().unwrap().status, NotificationStatus::Delivered);

        assert!(q.record_delivery_event(&delivery_id, DeliveryEvent::Clicked).unwrap());
        assert_eq!(db.get(&id).unwrap().unwrap().status, NotificationStatus::Clicked);

        assert!(!q.record_delivery_event("missing", DeliveryEvent::Clicked).unwrap());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn scheduled_future_items_wait() {
        let delivery = ScriptedDelivery::new(true);
        let (q, db, path) = queue("scheduled", MemPrefs::empty(), delivery.clone());
        let mut req = EnqueueRequest::new("u1", "system", "Tomorrow", "thing");
        req.scheduled_for = Some(Utc::now() + Duration::hours(12));
        let id = q.enqueue(req).unwrap();

        let report = q.process_queue(10).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(db.get(&id).unwrap().unwrap().status, NotificationStatus::Scheduled);
        std::fs::remove_file(&path).ok();
    }
}
