//! Batching — folds related low-priority notifications into one summary.
//!
//! A notification is held for batching only when it carries a batch key
//! and its priority is below 8. The window is anchored at the *oldest*
//! member's creation time; once `now ≥ oldest.created_at + window` the
//! batch is ready to flush.

use chrono::{DateTime, Duration, Utc};

use nudge_core::prefs::CategoryPolicy;
use nudge_core::types::Notification;

/// Priority at or above which a notification is never batched.
const BATCH_PRIORITY_CEILING: u8 = 8;

/// How many members the summary body previews.
const PREVIEW_MEMBERS: usize = 3;

/// Preview truncation length in characters.
const PREVIEW_CHARS: usize = 30;

/// A flushable batch summary.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub user_id: String,
    pub batch_key: String,
    pub title: String,
    pub body: String,
    /// Member IDs, priority-desc then creation-asc.
    pub notification_ids: Vec<String>,
    /// Max of the member priorities.
    pub priority: u8,
}

/// Whether this notification should be held for batching.
pub fn should_batch(n: &Notification, policy: &CategoryPolicy) -> bool {
    n.batch_key.is_some() && n.priority < BATCH_PRIORITY_CEILING && policy.batchable
}

/// Whether the batch window anchored at the oldest member has closed.
pub fn window_expired(
    oldest_created_at: DateTime<Utc>,
    window_secs: u32,
    now: DateTime<Utc>,
) -> bool {
    now >= oldest_created_at + Duration::seconds(window_secs as i64)
}

/// Build the summary for a non-empty batch. Members are previewed in
/// priority-desc, then creation-time-asc order.
pub fn build_summary(members: &[Notification]) -> BatchSummary {
    let mut ordered: Vec<&Notification> = members.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });

    let count = ordered.len();
    let user_id = ordered
        .first()
        .map(|n| n.user_id.clone())
        .unwrap_or_default();
    let batch_key = ordered
        .first()
        .and_then(|n| n.batch_key.clone())
        .unwrap_or_default();
    let category = ordered
        .first()
        .map(|n| n.category.as_str())
        .unwrap_or_default();

    let mut lines: Vec<String> = ordered
        .iter()
        .take(PREVIEW_MEMBERS)
        .map(|n| format!("• {}", truncate(&n.title, PREVIEW_CHARS)))
        .collect();
    if count > PREVIEW_MEMBERS {
        lines.push(format!("...and {} more", count - PREVIEW_MEMBERS));
    }

    BatchSummary {
        user_id,
        batch_key,
        title: summary_title(category, count),
        body: lines.join("\n"),
        notification_ids: ordered.iter().map(|n| n.id.clone()).collect(),
        priority: ordered.iter().map(|n| n.priority).max().unwrap_or(1),
    }
}

/// Forward-facing phrasing per category — an invitation, not a nag.
fn summary_title(category: &str, count: usize) -> String {
    match category {
        "task_reminder" => format!("{count} tasks ready when you're ready"),
        "daily_summary" => format!("{count} updates from your day"),
        "insight" => format!("{count} things worth a look"),
        _ => format!("{count} updates waiting for you"),
    }
}

/// Truncate on a char boundary with an ellipsis.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::prefs::CategoryPolicy;

    fn member(title: &str, priority: u8, age_secs: i64) -> Notification {
        let mut n = Notification::new("u1", "task_reminder", title, "body", priority);
        n.batch_key = Some("task_reminder".into());
        n.created_at = Utc::now() - Duration::seconds(age_secs);
        n
    }

    #[test]
    fn no_batch_key_never_batches() {
        let n = Notification::new("u1", "task_reminder", "t", "b", 3);
        let policy = CategoryPolicy::defaults_for("task_reminder");
        assert!(!should_batch(&n, &policy));
    }

    #[test]
    fn high_priority_never_batches() {
        let n = member("urgent", 8, 0);
        let policy = CategoryPolicy::defaults_for("task_reminder");
        assert!(!should_batch(&n, &policy));
        assert!(should_batch(&member("mild", 7, 0), &policy));
    }

    #[test]
    fn unbatchable_category_never_batches() {
        let mut n = member("commit", 5, 0);
        n.category = "commitment_due".into();
        let policy = CategoryPolicy::defaults_for("commitment_due");
        assert!(!should_batch(&n, &policy));
    }

    #[test]
    fn window_anchored_at_oldest() {
        let oldest = Utc::now() - Duration::seconds(301);
        assert!(window_expired(oldest, 300, Utc::now()));
        let fresh = Utc::now() - Duration::seconds(120);
        assert!(!window_expired(fresh, 300, Utc::now()));
    }

    #[test]
    fn summary_of_three_task_reminders() {
        // Scenario: 3 task_reminder items, 2 minutes apart, window 300s.
        let members = vec![
            member("Water the plants", 3, 240),
            member("Reply to Dana", 5, 120),
            member("Stretch break", 2, 0),
        ];
        let summary = build_summary(&members);
        assert!(summary.title.contains('3'));
        assert_eq!(summary.priority, 5);
        assert_eq!(summary.notification_ids.len(), 3);
        // Priority-desc ordering puts "Reply to Dana" first.
        assert!(summary.body.starts_with("• Reply to Dana"));
        assert!(!summary.body.contains("more"));
    }

    #[test]
    fn summary_previews_three_and_counts_the_rest() {
        let members: Vec<Notification> = (0..5)
            .map(|i| member(&format!("Task number {i} with a fairly long title"), 3, i * 60))
            .collect();
        let summary = build_summary(&members);
        assert!(summary.body.contains("...and 2 more"));
        assert_eq!(summary.body.lines().count(), 4);
        // Previews are truncated to ~30 chars plus ellipsis.
        for line in summary.body.lines().take(3) {
            assert!(line.chars().count() <= 2 + PREVIEW_CHARS + 1);
        }
    }

    #[test]
    fn ties_break_by_creation_time() {
        let members = vec![
            member("second", 3, 10),
            member("first", 3, 20),
        ];
        let summary = build_summary(&members);
        assert!(summary.body.starts_with("• first"));
    }
}
