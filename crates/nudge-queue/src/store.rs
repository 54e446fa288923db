//! SQLite-backed queue store — notifications and the delivery log.
//!
//! The claim operations here are the concurrency guard for the whole
//! pipeline: a notification moves to `sending` only through a conditional
//! UPDATE, so two scan cycles can never both dispatch the same row. A
//! failed claim is a normal outcome, not an error.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use nudge_core::error::{NudgeError, Result};
use nudge_core::types::{
    DeliveryEvent, DeliveryLogEntry, DeliveryStatus, Notification, NotificationStatus,
};

/// Persistence for the notification queue subsystem.
pub struct QueueDb {
    conn: Mutex<Connection>,
}

impl QueueDb {
    /// Open or create the queue database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                batch_key TEXT,
                batch_window_secs INTEGER,
                scheduled_for TEXT,
                expires_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                created_at TEXT NOT NULL,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_scan
                ON notifications(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_notifications_batch
                ON notifications(user_id, batch_key, status);

            -- One row per (notification, subscription) delivery attempt
            CREATE TABLE IF NOT EXISTS delivery_log (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                subscription_id TEXT,
                status TEXT NOT NULL,
                error TEXT,
                sent_at TEXT NOT NULL,
                delivered_at TEXT,
                clicked_at TEXT,
                dismissed_at TEXT,
                FOREIGN KEY (notification_id) REFERENCES notifications(id)
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_log_notification
                ON delivery_log(notification_id);
            CREATE INDEX IF NOT EXISTS idx_delivery_log_sent
                ON delivery_log(sent_at);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NudgeError::Store(format!("queue db lock poisoned: {e}")))
    }

    // ─── Notifications ────────────────────────────────

    /// Insert a new notification.
    pub fn insert(&self, n: &Notification) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notifications
             (id, user_id, category, title, body, priority, batch_key, batch_window_secs,
              scheduled_for, expires_at, status, error, created_at, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                n.id,
                n.user_id,
                n.category,
                n.title,
                n.body,
                n.priority,
                n.batch_key,
                n.batch_window_secs,
                n.scheduled_for.map(|t| t.to_rfc3339()),
                n.expires_at.map(|t| t.to_rfc3339()),
                n.status.as_str(),
                n.error,
                n.created_at.to_rfc3339(),
                n.sent_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch one notification by ID.
    pub fn get(&self, id: &str) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {NOTIFICATION_COLS} FROM notifications WHERE id = ?1"),
                rusqlite::params![id],
                map_notification,
            )
            .optional()?;
        Ok(row)
    }

    /// Rows a scan cycle should look at: pending items, scheduled items
    /// that have come due, and held batch members (to check their window).
    pub fn scan_candidates(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLS} FROM notifications
             WHERE status = 'pending'
                OR (status = 'scheduled' AND scheduled_for <= ?1)
                OR status = 'batched'
             ORDER BY created_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![now.to_rfc3339(), limit as i64],
            map_notification,
        )?;
        collect(rows)
    }

    /// Atomically claim a notification for delivery: `from` → `sending`.
    /// Returns false when another worker got there first (or the row moved
    /// on) — callers must treat that as a silent skip.
    pub fn claim(&self, id: &str, from: NotificationStatus) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET status = 'sending' WHERE id = ?1 AND status = ?2",
            rusqlite::params![id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Claim every member of a batch (`batched` → `sending`) in one
    /// transaction. Rolls back and returns false if any member was
    /// already taken, so a concurrent flush can never split a batch.
    pub fn claim_batch(&self, ids: &[String]) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for id in ids {
            let changed = tx.execute(
                "UPDATE notifications SET status = 'sending'
                 WHERE id = ?1 AND status = 'batched'",
                rusqlite::params![id],
            )?;
            if changed != 1 {
                return Ok(false); // tx dropped → rollback
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Move all members of a flushed batch to the same terminal status
    /// with the same `sent_at`, atomically.
    pub fn finalize_batch(
        &self,
        ids: &[String],
        status: NotificationStatus,
        sent_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE notifications SET status = ?2, sent_at = ?3, error = ?4 WHERE id = ?1",
                rusqlite::params![id, status.as_str(), sent_at.to_rfc3339(), error],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Hold a pending notification for batching.
    pub fn mark_batched(&self, id: &str, window_secs: u32) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET status = 'batched', batch_window_secs = ?2
             WHERE id = ?1 AND status IN ('pending', 'scheduled')",
            rusqlite::params![id, window_secs],
        )?;
        Ok(changed == 1)
    }

    /// Push a blocked notification to a later attempt.
    pub fn reschedule(&self, id: &str, retry_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET status = 'scheduled', scheduled_for = ?2
             WHERE id = ?1 AND status IN ('pending', 'scheduled')",
            rusqlite::params![id, retry_at.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Suppress a notification (globally disabled preferences). Kept in
    /// history, never delivered.
    pub fn suppress(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET status = 'suppressed'
             WHERE id = ?1 AND status IN ('pending', 'scheduled', 'batched')",
            rusqlite::params![id],
        )?;
        Ok(changed == 1)
    }

    /// Expire a notification that ran out of time before delivery.
    pub fn mark_expired(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET status = 'expired'
             WHERE id = ?1 AND status IN ('pending', 'scheduled', 'batched', 'suppressed')",
            rusqlite::params![id],
        )?;
        Ok(changed == 1)
    }

    /// Record a successful send.
    pub fn mark_sent(&self, id: &str, sent_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE notifications SET status = 'sent', sent_at = ?2, error = NULL
             WHERE id = ?1",
            rusqlite::params![id, sent_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record terminal failure with a diagnostic reason.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE notifications SET status = 'failed', error = ?2 WHERE id = ?1",
            rusqlite::params![id, error],
        )?;
        Ok(())
    }

    /// Cancel if the notification has not been claimed yet. In-flight
    /// deliveries run to completion.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET status = 'cancelled'
             WHERE id = ?1 AND status IN ('pending', 'scheduled', 'batched')",
            rusqlite::params![id],
        )?;
        Ok(changed == 1)
    }

    /// Advance the lifecycle from a client delivery event. Only forward
    /// transitions are applied.
    pub fn advance_status(&self, id: &str, event: DeliveryEvent) -> Result<bool> {
        let conn = self.lock()?;
        let changed = match event {
            DeliveryEvent::Delivered => conn.execute(
                "UPDATE notifications SET status = 'delivered'
                 WHERE id = ?1 AND status = 'sent'",
                rusqlite::params![id],
            )?,
            DeliveryEvent::Clicked => conn.execute(
                "UPDATE notifications SET status = 'clicked'
                 WHERE id = ?1 AND status IN ('sent', 'delivered')",
                rusqlite::params![id],
            )?,
            DeliveryEvent::Dismissed => conn.execute(
                "UPDATE notifications SET status = 'dismissed'
                 WHERE id = ?1 AND status IN ('sent', 'delivered')",
                rusqlite::params![id],
            )?,
        };
        Ok(changed == 1)
    }

    /// Undelivered notifications for a user.
    pub fn pending_for_user(&self, user_id: &str) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLS} FROM notifications
             WHERE user_id = ?1 AND status IN ('pending', 'scheduled', 'batched')
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![user_id], map_notification)?;
        collect(rows)
    }

    /// Held batch members for (user, batch key), oldest first.
    pub fn batch_members(&self, user_id: &str, batch_key: &str) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLS} FROM notifications
             WHERE user_id = ?1 AND batch_key = ?2 AND status = 'batched'
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![user_id, batch_key], map_notification)?;
        collect(rows)
    }

    /// Most recent notifications for a user, newest first.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLS} FROM notifications
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit as i64], map_notification)?;
        collect(rows)
    }

    /// Notification counts per status, for the startup/report log line.
    pub fn status_counts(&self) -> Result<Vec<(String, u32)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM notifications GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get::<_, i64>(1)? as u32)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ─── Delivery log ─────────────────────────────────

    /// Append one delivery attempt outcome.
    pub fn insert_log(&self, entry: &DeliveryLogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO delivery_log
             (id, notification_id, subscription_id, status, error,
              sent_at, delivered_at, clicked_at, dismissed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                entry.id,
                entry.notification_id,
                entry.subscription_id,
                entry.status.as_str(),
                entry.error,
                entry.sent_at.to_rfc3339(),
                entry.delivered_at.map(|t| t.to_rfc3339()),
                entry.clicked_at.map(|t| t.to_rfc3339()),
                entry.dismissed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch one delivery log entry.
    pub fn get_log(&self, delivery_id: &str) -> Result<Option<DeliveryLogEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, notification_id, subscription_id, status, error,
                        sent_at, delivered_at, clicked_at, dismissed_at
                 FROM delivery_log WHERE id = ?1",
                rusqlite::params![delivery_id],
                map_log_entry,
            )
            .optional()?;
        Ok(row)
    }

    /// Apply a client-reported event to a log entry, keeping timestamps
    /// monotonically non-decreasing within the row. Returns the updated
    /// entry, or None when the delivery ID is unknown.
    pub fn record_event(
        &self,
        delivery_id: &str,
        event: DeliveryEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryLogEntry>> {
        let Some(mut entry) = self.get_log(delivery_id)? else {
            return Ok(None);
        };

        // Clamp against earlier timestamps in the same entry.
        let floor = entry
            .delivered_at
            .unwrap_or(entry.sent_at)
            .max(entry.sent_at);
        let at = now.max(floor);

        match event {
            DeliveryEvent::Delivered => {
                entry.delivered_at.get_or_insert(at);
                entry.status = DeliveryStatus::Delivered;
            }
            DeliveryEvent::Clicked => {
                entry.delivered_at.get_or_insert(at);
                entry.clicked_at.get_or_insert(at);
                entry.status = DeliveryStatus::Clicked;
            }
            DeliveryEvent::Dismissed => {
                entry.delivered_at.get_or_insert(at);
                entry.dismissed_at.get_or_insert(at);
                entry.status = DeliveryStatus::Dismissed;
            }
        }

        let conn = self.lock()?;
        conn.execute(
            "UPDATE delivery_log
             SET status = ?2, delivered_at = ?3, clicked_at = ?4, dismissed_at = ?5
             WHERE id = ?1",
            rusqlite::params![
                entry.id,
                entry.status.as_str(),
                entry.delivered_at.map(|t| t.to_rfc3339()),
                entry.clicked_at.map(|t| t.to_rfc3339()),
                entry.dismissed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(Some(entry))
    }

    /// Log entries for a notification.
    pub fn log_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, notification_id, subscription_id, status, error,
                    sent_at, delivered_at, clicked_at, dismissed_at
             FROM delivery_log WHERE notification_id = ?1 ORDER BY sent_at ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![notification_id], map_log_entry)?;
        collect(rows)
    }

    /// Distinct notifications for a user with a non-failed delivery row
    /// since `since` — the rate limiter's trailing-hour count. Batched
    /// member rows count individually; a brief overshoot under load is
    /// acceptable and self-corrects.
    pub fn deliveries_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT d.notification_id)
             FROM delivery_log d
             JOIN notifications n ON n.id = d.notification_id
             WHERE n.user_id = ?1 AND d.sent_at >= ?2 AND d.status != 'failed'",
            rusqlite::params![user_id, since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }
}

const NOTIFICATION_COLS: &str = "id, user_id, category, title, body, priority, batch_key, \
     batch_window_secs, scheduled_for, expires_at, status, error, created_at, sent_at";

fn map_notification(r: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: r.get(0)?,
        user_id: r.get(1)?,
        category: r.get(2)?,
        title: r.get(3)?,
        body: r.get(4)?,
        priority: r.get::<_, i64>(5)? as u8,
        batch_key: r.get(6)?,
        batch_window_secs: r.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        scheduled_for: parse_ts_opt(r.get::<_, Option<String>>(8)?),
        expires_at: parse_ts_opt(r.get::<_, Option<String>>(9)?),
        status: NotificationStatus::parse(&r.get::<_, String>(10)?),
        error: r.get(11)?,
        created_at: parse_ts(&r.get::<_, String>(12)?),
        sent_at: parse_ts_opt(r.get::<_, Option<String>>(13)?),
    })
}

fn map_log_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryLogEntry> {
    Ok(DeliveryLogEntry {
        id: r.get(0)?,
        notification_id: r.get(1)?,
        subscription_id: r.get(2)?,
        status: DeliveryStatus::parse(&r.get::<_, String>(3)?),
        error: r.get(4)?,
        sent_at: parse_ts(&r.get::<_, String>(5)?),
        delivered_at: parse_ts_opt(r.get::<_, Option<String>>(6)?),
        clicked_at: parse_ts_opt(r.get::<_, Option<String>>(7)?),
        dismissed_at: parse_ts_opt(r.get::<_, Option<String>>(8)?),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
