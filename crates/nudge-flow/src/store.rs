//! SQLite-backed store for activity samples, hour-of-week patterns, and
//! manual focus overrides.
//!
//! Samples are append-only and pruned after 24h; patterns are rolling
//! aggregates updated with an online mean and never deleted.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use nudge_core::error::{NudgeError, Result};
use nudge_core::types::{ActivityPattern, FlowOverride};

/// Persistence for everything the flow scorer owns.
pub struct FlowDb {
    conn: Mutex<Connection>,
}

impl FlowDb {
    /// Open or create the flow database.
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
            -- Raw activity samples, pruned after 24h
            CREATE TABLE IF NOT EXISTS activity_samples (
                user_id TEXT NOT NULL,
                response_latency REAL,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_samples_user_at
                ON activity_samples(user_id, at);

            -- Rolling per-(user, hour, weekday) aggregates
            CREATE TABLE IF NOT EXISTS activity_patterns (
                user_id TEXT NOT NULL,
                hour INTEGER NOT NULL,
                weekday INTEGER NOT NULL,
                avg_messages REAL NOT NULL DEFAULT 0,
                avg_latency REAL,
                flow_score REAL NOT NULL DEFAULT 50,
                sample_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, hour, weekday)
            );

            -- Manual focus overrides, one row per user
            CREATE TABLE IF NOT EXISTS flow_overrides (
                user_id TEXT PRIMARY KEY,
                is_focusing INTEGER NOT NULL DEFAULT 1,
                until TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NudgeError::Store(format!("flow db lock poisoned: {e}")))
    }

    // ─── Samples ──────────────────────────────────────

    /// Append one activity sample.
    pub fn record_sample(
        &self,
        user_id: &str,
        response_latency_secs: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO activity_samples (user_id, response_latency, at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, response_latency_secs, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Sample count and mean response latency for a user since `since`.
    pub fn window_stats(&self, user_id: &str, since: DateTime<Utc>) -> Result<(u32, Option<f64>)> {
        let conn = self.lock()?;
        let (count, avg): (u32, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(response_latency)
             FROM activity_samples WHERE user_id = ?1 AND at >= ?2",
            rusqlite::params![user_id, since.to_rfc3339()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((count, avg))
    }

    /// Drop samples older than `cutoff`. Returns rows removed.
    pub fn prune_samples(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM activity_samples WHERE at < ?1",
            rusqlite::params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }

    // ─── Patterns ─────────────────────────────────────

    /// Fold one observation into the (user, hour, weekday) aggregate
    /// using an online mean update.
    pub fn observe_pattern(
        &self,
        user_id: &str,
        hour: u8,
        weekday: u8,
        messages: f64,
        latency_secs: Option<f64>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let existing: Option<(f64, Option<f64>, u32)> = conn
            .query_row(
                "SELECT avg_messages, avg_latency, sample_count FROM activity_patterns
                 WHERE user_id = ?1 AND hour = ?2 AND weekday = ?3",
                rusqlite::params![user_id, hour, weekday],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        let (avg_messages, avg_latency, count) = match existing {
            Some((avg_m, avg_l, n)) => {
                let n1 = n + 1;
                let new_m = avg_m + (messages - avg_m) / n1 as f64;
                let new_l = match (avg_l, latency_secs) {
                    (Some(old), Some(x)) => Some(old + (x - old) / n1 as f64),
                    (Some(old), None) => Some(old),
                    (None, x) => x,
                };
                (new_m, new_l, n1)
            }
            None => (messages, latency_secs, 1),
        };

        conn.execute(
            "INSERT OR REPLACE INTO activity_patterns
             (user_id, hour, weekday, avg_messages, avg_latency, flow_score, sample_count)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     COALESCE((SELECT flow_score FROM activity_patterns
                               WHERE user_id = ?1 AND hour = ?2 AND weekday = ?3), 50),
                     ?6)",
            rusqlite::params![user_id, hour, weekday, avg_messages, avg_latency, count],
        )?;
        Ok(())
    }

    /// The aggregate for one (user, hour, weekday) slot.
    pub fn get_pattern(&self, user_id: &str, hour: u8, weekday: u8) -> Result<Option<ActivityPattern>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT user_id, hour, weekday, avg_messages, avg_latency, flow_score, sample_count
                 FROM activity_patterns WHERE user_id = ?1 AND hour = ?2 AND weekday = ?3",
                rusqlite::params![user_id, hour, weekday],
                map_pattern,
            )
            .optional()?;
        Ok(row)
    }

    /// All patterns with at least `min_samples` observations.
    pub fn patterns_with_min_samples(&self, min_samples: u32) -> Result<Vec<ActivityPattern>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, hour, weekday, avg_messages, avg_latency, flow_score, sample_count
             FROM activity_patterns WHERE sample_count >= ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![min_samples], map_pattern)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Store the recomputed flow score for one pattern slot.
    pub fn set_pattern_score(&self, user_id: &str, hour: u8, weekday: u8, score: f64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE activity_patterns SET flow_score = ?4
             WHERE user_id = ?1 AND hour = ?2 AND weekday = ?3",
            rusqlite::params![user_id, hour, weekday, score],
        )?;
        Ok(())
    }

    // ─── Overrides ────────────────────────────────────

    /// Set (or replace) the user's focus override.
    pub fn set_override(&self, user_id: &str, until: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO flow_overrides (user_id, is_focusing, until)
             VALUES (?1, 1, ?2)",
            rusqlite::params![user_id, until.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Clear the user's focus override.
    pub fn clear_override(&self, user_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM flow_overrides WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        Ok(())
    }

    /// Active override for a user, if any. Expiry is checked lazily here:
    /// a row past its `until` is deleted and reads as absent. A row that
    /// fails to parse is treated as "not focusing" and cleared.
    pub fn get_override(&self, user_id: &str, now: DateTime<Utc>) -> Result<Option<FlowOverride>> {
        let conn = self.lock()?;
        let row: Option<(bool, String)> = conn
            .query_row(
                "SELECT is_focusing, until FROM flow_overrides WHERE user_id = ?1",
                rusqlite::params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let Some((is_focusing, until_raw)) = row else {
            return Ok(None);
        };
        let until = match DateTime::parse_from_rfc3339(&until_raw) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!("⚠️ Corrupt flow override for {user_id}, clearing: {e}");
                conn.execute(
                    "DELETE FROM flow_overrides WHERE user_id = ?1",
                    rusqlite::params![user_id],
                )?;
                return Ok(None);
            }
        };
        if now > until {
            conn.execute(
                "DELETE FROM flow_overrides WHERE user_id = ?1",
                rusqlite::params![user_id],
            )?;
            return Ok(None);
        }
        Ok(Some(FlowOverride { user_id: user_id.to_string(), is_focusing, until }))
    }
}

fn map_pattern(r: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityPattern> {
    Ok(ActivityPattern {
        user_id: r.get(0)?,
        hour: r.get::<_, i64>(1)? as u8,
        weekday: r.get::<_, i64>(2)? as u8,
        avg_messages: r.get(3)?,
        avg_latency_secs: r.get(4)?,
        flow_score: r.get(5)?,
        sample_count: r.get::<_, i64>(6)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_temp(name: &str) -> (FlowDb, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("nudge-test-flow-{name}.db"));
        std::fs::remove_file(&path).ok();
        (FlowDb::open(&path).unwrap(), path)
    }

    #[test]
    fn sample_window_counting() {
        let (db, path) = open_temp("window");
        let now = Utc::now();
        db.record_sample("u1", Some(20.0), now - Duration::minutes(5)).unwrap();
        db.record_sample("u1", Some(40.0), now - Duration::minutes(2)).unwrap();
        db.record_sample("u1", None, now - Duration::minutes(60)).unwrap();
        let (count, avg) = db.window_stats("u1", now - Duration::minutes(15)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(avg, Some(30.0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn prune_drops_old_samples() {
        let (db, path) = open_temp("prune");
        let now = Utc::now();
        db.record_sample("u1", None, now - Duration::hours(25)).unwrap();
        db.record_sample("u1", None, now).unwrap();
        let removed = db.prune_samples(now - Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn pattern_online_mean() {
        let (db, path) = open_temp("pattern");
        db.observe_pattern("u1", 9, 1, 2.0, Some(30.0)).unwrap();
        db.observe_pattern("u1", 9, 1, 4.0, Some(60.0)).unwrap();
        let p = db.get_pattern("u1", 9, 1).unwrap().unwrap();
        assert_eq!(p.sample_count, 2);
        assert!((p.avg_messages - 3.0).abs() < 1e-9);
        assert!((p.avg_latency_secs.unwrap() - 45.0).abs() < 1e-9);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn pattern_mean_ignores_missing_latency() {
        let (db, path) = open_temp("pattern-latency");
        db.observe_pattern("u1", 9, 1, 2.0, Some(30.0)).unwrap();
        db.observe_pattern("u1", 9, 1, 2.0, None).unwrap();
        let p = db.get_pattern("u1", 9, 1).unwrap().unwrap();
        assert_eq!(p.avg_latency_secs, Some(30.0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn override_lazy_expiry() {
        let (db, path) = open_temp("override");
        let now = Utc::now();
        db.set_override("u1", now + Duration::minutes(30)).unwrap();
        assert!(db.get_override("u1", now).unwrap().is_some());
        // Reading past expiry clears the row
        assert!(db.get_override("u1", now + Duration::minutes(31)).unwrap().is_none());
        assert!(db.get_override("u1", now).unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }
}
