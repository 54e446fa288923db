//! SQLite-backed push subscription registry.
//!
//! One row per endpoint URL. Re-subscribing from the same endpoint
//! updates the keys in place and reactivates the row, so a device that
//! unsubscribed and came back keeps its history.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::SubscriptionRegistry;
use nudge_core::types::PushSubscription;

pub struct SubscriptionDb {
    conn: Mutex<Connection>,
}

impl SubscriptionDb {
    /// Open or create the subscription database.
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
            CREATE TABLE IF NOT EXISTS push_subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                endpoint TEXT NOT NULL UNIQUE,
                auth TEXT NOT NULL,
                p256dh TEXT NOT NULL,
                user_agent TEXT,
                device_name TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                fail_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subs_user_active
                ON push_subscriptions(user_id, active);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NudgeError::Store(format!("subscription db lock poisoned: {e}")))
    }

    /// Register a device endpoint. An existing row for the same endpoint
    /// gets fresh keys and is reactivated; the stored ID is returned
    /// either way.
    pub fn subscribe(&self, sub: &PushSubscription) -> Result<String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO push_subscriptions
                 (id, user_id, endpoint, auth, p256dh, user_agent, device_name,
                  active, fail_count, last_used_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 0, NULL, ?8)
             ON CONFLICT(endpoint) DO UPDATE SET
                 user_id = excluded.user_id,
                 auth = excluded.auth,
                 p256dh = excluded.p256dh,
                 user_agent = excluded.user_agent,
                 device_name = excluded.device_name,
                 active = 1,
                 fail_count = 0",
            rusqlite::params![
                sub.id,
                sub.user_id,
                sub.endpoint,
                sub.auth,
                sub.p256dh,
                sub.user_agent,
                sub.device_name,
                sub.created_at.to_rfc3339(),
            ],
        )?;
        let id: String = conn.query_row(
            "SELECT id FROM push_subscriptions WHERE endpoint = ?1",
            [&sub.endpoint],
            |row| row.get(0),
        )?;
        tracing::info!("🔔 Subscription {id} registered for {}", sub.user_id);
        Ok(id)
    }

    /// Deactivate by endpoint URL. Returns false if no such endpoint.
    pub fn unsubscribe(&self, endpoint: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE push_subscriptions SET active = 0 WHERE endpoint = ?1",
            [endpoint],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<PushSubscription>> {
        let conn = self.lock()?;
        let sub = conn
            .query_row(
                &format!("SELECT {SUBSCRIPTION_COLS} FROM push_subscriptions WHERE id = ?1"),
                [id],
                map_subscription,
            )
            .optional()?;
        Ok(sub)
    }

    /// All subscriptions for a user, active or not.
    pub fn list(&self, user_id: &str) -> Result<Vec<PushSubscription>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLS} FROM push_subscriptions
             WHERE user_id = ?1 ORDER BY created_at"
        ))?;
        let subs = stmt
            .query_map([user_id], map_subscription)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(subs)
    }

    fn list_active_sync(&self, user_id: &str) -> Result<Vec<PushSubscription>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLS} FROM push_subscriptions
             WHERE user_id = ?1 AND active = 1 ORDER BY created_at"
        ))?;
        let subs = stmt
            .query_map([user_id], map_subscription)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(subs)
    }

    fn deactivate_sync(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE push_subscriptions SET active = 0 WHERE id = ?1", [id])?;
        Ok(())
    }

    fn mark_used_sync(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE push_subscriptions SET last_used_at = ?1, fail_count = 0 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Count a failed attempt against the endpoint.
    pub fn record_failure(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE push_subscriptions SET fail_count = fail_count + 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRegistry for SubscriptionDb {
    async fn list_active(&self, user_id: &str) -> Result<Vec<PushSubscription>> {
        self.list_active_sync(user_id)
    }

    async fn deactivate(&self, subscription_id: &str) -> Result<()> {
        tracing::info!("🗑️ Deactivating subscription {subscription_id}");
        self.deactivate_sync(subscription_id)
    }

    async fn mark_used(&self, subscription_id: &str) -> Result<()> {
        self.mark_used_sync(subscription_id)
    }
}

const SUBSCRIPTION_COLS: &str = "id, user_id, endpoint, auth, p256dh, user_agent, device_name, \
                                 active, fail_count, last_used_at, created_at";

fn map_subscription(row: &Row<'_>) -> rusqlite::Result<PushSubscription> {
    Ok(PushSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        endpoint: row.get(2)?,
        auth: row.get(3)?,
        p256dh: row.get(4)?,
        user_agent: row.get(5)?,
        device_name: row.get(6)?,
        active: row.get::<_, i64>(7)? != 0,
        fail_count: row.get::<_, i64>(8)? as u32,
        last_used_at: parse_opt_ts(row.get::<_, Option<String>>(9)?),
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(name: &str) -> (SubscriptionDb, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("nudge-test-subs-{name}.db"));
        std::fs::remove_file(&path).ok();
        (SubscriptionDb::open(&path).unwrap(), path)
    }

    #[tokio::test]
    async fn subscribe_and_list_active() {
        let (db, path) = setup("basic");
        let sub = PushSubscription::new("u1", "https://push.example/ep1", "a", "p");
        db.subscribe(&sub).unwrap();

        let active = db.list_active("u1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].endpoint, "https://push.example/ep1");
        assert!(active[0].active);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn resubscribing_same_endpoint_updates_in_place() {
        let (db, path) = setup("upsert");
        let first = PushSubscription::new("u1", "https://push.example/ep1", "a1", "p1");
        let id1 = db.subscribe(&first).unwrap();

        let mut second = PushSubscription::new("u1", "https://push.example/ep1", "a2", "p2");
        second.device_name = Some("laptop".into());
        let id2 = db.subscribe(&second).unwrap();

        // Same endpoint keeps the original row's identity.
        assert_eq!(id1, id2);
        let subs = db.list("u1").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].auth, "a2");
        assert_eq!(subs[0].device_name.as_deref(), Some("laptop"));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn unsubscribe_deactivates_but_keeps_the_row() {
        let (db, path) = setup("unsub");
        let sub = PushSubscription::new("u1", "https://push.example/ep1", "a", "p");
        db.subscribe(&sub).unwrap();

        assert!(db.unsubscribe("https://push.example/ep1").unwrap());
        assert!(!db.unsubscribe("https://push.example/other").unwrap());
        assert!(db.list_active("u1").await.unwrap().is_empty());
        assert_eq!(db.list("u1").unwrap().len(), 1);

        // Coming back reactivates.
        db.subscribe(&sub).unwrap();
        assert_eq!(db.list_active("u1").await.unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn mark_used_resets_fail_count() {
        let (db, path) = setup("used");
        let sub = PushSubscription::new("u1", "https://push.example/ep1", "a", "p");
        let id = db.subscribe(&sub).unwrap();

        db.record_failure(&id).unwrap();
        db.record_failure(&id).unwrap();
        assert_eq!(db.get(&id).unwrap().unwrap().fail_count, 2);

        db.mark_used(&id).await.unwrap();
        let sub = db.get(&id).unwrap().unwrap();
        assert_eq!(sub.fail_count, 0);
        assert!(sub.last_used_at.is_some());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn deactivated_rows_are_never_listed_active() {
        let (db, path) = setup("gone");
        let sub = PushSubscription::new("u1", "https://push.example/ep1", "a", "p");
        let id = db.subscribe(&sub).unwrap();
        db.deactivate(&id).await.unwrap();
        assert!(db.list_active("u1").await.unwrap().is_empty());
        std::fs::remove_file(&path).ok();
    }
}
