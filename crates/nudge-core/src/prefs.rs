//! User notification preferences and per-category policy.
//!
//! Preferences are external configuration from the pipeline's point of
//! view: consumed read-only, and a missing or corrupt row always degrades
//! to defaults rather than blocking enqueue or delivery.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{NudgeError, Result};

/// Per-user notification preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Global kill switch — false suppresses everything.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Quiet hours start, "HH:MM" user-local. None disables quiet hours.
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    /// Quiet hours end, "HH:MM" user-local. May wrap past midnight.
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    /// IANA timezone name, e.g. "Europe/Berlin".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Priority at or above which flow state no longer suppresses.
    #[serde(default = "default_flow_threshold")]
    pub flow_interrupt_threshold: u8,
    /// Default batch window in seconds.
    #[serde(default = "default_batch_window")]
    pub batch_window_secs: u32,
    /// Max notifications delivered in any trailing hour.
    #[serde(default = "default_max_per_hour")]
    pub max_notifications_per_hour: u32,
    /// Minutes to back off once the hourly cap is hit.
    #[serde(default = "default_cooldown")]
    pub cooldown_after_burst_mins: u32,
    /// Per-category overrides, keyed by category name.
    #[serde(default)]
    pub categories: HashMap<String, CategoryOverride>,
}

fn bool_true() -> bool { true }
fn default_timezone() -> String { "UTC".into() }
fn default_flow_threshold() -> u8 { 8 }
fn default_batch_window() -> u32 { 900 }
fn default_max_per_hour() -> u32 { 6 }
fn default_cooldown() -> u32 { 30 }

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_hours_start: None,
            quiet_hours_end: None,
            timezone: default_timezone(),
            flow_interrupt_threshold: default_flow_threshold(),
            batch_window_secs: default_batch_window(),
            max_notifications_per_hour: default_max_per_hour(),
            cooldown_after_burst_mins: default_cooldown(),
            categories: HashMap::new(),
        }
    }
}

impl UserPreferences {
    /// Effective policy for a category, merging defaults with the user's
    /// override for that category.
    pub fn category_policy(&self, category: &str) -> CategoryPolicy {
        let mut policy = CategoryPolicy::defaults_for(category);
        if let Some(user_override) = self.categories.get(category) {
            policy.enabled = user_override.enabled;
            if let Some(min) = user_override.min_priority {
                policy.min_priority = min;
            }
            if let Some(batch) = user_override.batch_override {
                policy.batchable = batch;
            }
        }
        policy
    }
}

/// A user's override for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryOverride {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Minimum priority the user wants from this category.
    #[serde(default)]
    pub min_priority: Option<u8>,
    /// Force batching on/off regardless of the category default.
    #[serde(default)]
    pub batch_override: Option<bool>,
}

/// Resolved per-category delivery policy.
#[derive(Debug, Clone)]
pub struct CategoryPolicy {
    pub enabled: bool,
    pub default_priority: u8,
    pub min_priority: u8,
    pub batchable: bool,
    /// false means flow state never suppresses this category.
    pub can_suppress: bool,
    pub respect_flow_state: bool,
}

impl CategoryPolicy {
    /// Built-in defaults per category. Unknown categories get a middling
    /// interruptible profile.
    pub fn defaults_for(category: &str) -> Self {
        match category {
            "task_reminder" => Self {
                enabled: true,
                default_priority: 5,
                min_priority: 1,
                batchable: true,
                can_suppress: true,
                respect_flow_state: true,
            },
            // Commitments are promises the user made — never suppressed by flow.
            "commitment_due" => Self {
                enabled: true,
                default_priority: 8,
                min_priority: 1,
                batchable: false,
                can_suppress: false,
                respect_flow_state: false,
            },
            "daily_summary" => Self {
                enabled: true,
                default_priority: 3,
                min_priority: 1,
                batchable: true,
                can_suppress: true,
                respect_flow_state: true,
            },
            "insight" => Self {
                enabled: true,
                default_priority: 2,
                min_priority: 1,
                batchable: true,
                can_suppress: true,
                respect_flow_state: true,
            },
            "system" => Self {
                enabled: true,
                default_priority: 7,
                min_priority: 1,
                batchable: false,
                can_suppress: true,
                respect_flow_state: true,
            },
            _ => Self {
                enabled: true,
                default_priority: 5,
                min_priority: 1,
                batchable: true,
                can_suppress: true,
                respect_flow_state: true,
            },
        }
    }
}

/// Read access to per-user preferences. Implementations must degrade to
/// `UserPreferences::default()` on missing or corrupt data.
pub trait PreferencesStore: Send + Sync {
    fn get(&self, user_id: &str) -> UserPreferences;
    fn set(&self, user_id: &str, prefs: &UserPreferences) -> Result<()>;
}

/// SQLite-backed preferences store. One JSON row per user.
pub struct PrefsDb {
    conn: Mutex<Connection>,
}

impl PrefsDb {
    /// Open or create the preferences database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NudgeError::Store(format!("prefs lock poisoned: {e}")))
    }
}

impl PreferencesStore for PrefsDb {
    fn get(&self, user_id: &str) -> UserPreferences {
        let Ok(conn) = self.lock() else {
            return UserPreferences::default();
        };
        let row: Option<String> = conn
            .query_row(
                "SELECT data FROM user_preferences WHERE user_id = ?1",
                rusqlite::params![user_id],
                |r| r.get(0),
            )
            .ok();
        match row {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Corrupt preferences for {user_id}, using defaults: {e}");
                UserPreferences::default()
            }),
            None => UserPreferences::default(),
        }
    }

    fn set(&self, user_id: &str, prefs: &UserPreferences) -> Result<()> {
        let json = serde_json::to_string(prefs)
            .map_err(|e| NudgeError::Store(format!("serialize preferences: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO user_preferences (user_id, data, updated_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
