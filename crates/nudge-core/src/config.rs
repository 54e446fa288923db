//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub push: PushConfig,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            queue: QueueConfig::default(),
            push: PushConfig::default(),
        }
    }
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::NudgeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::NudgeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }
}

/// Flow detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How far back to look for activity when scoring (minutes).
    #[serde(default = "default_detection_window")]
    pub detection_window_minutes: i64,
    /// Samples within the window needed to consider the user in flow.
    #[serde(default = "default_min_activity")]
    pub min_activity_for_flow: u32,
    /// Score at or above which the user counts as in flow.
    #[serde(default = "default_flow_threshold")]
    pub flow_threshold: u8,
    /// Score at or above which the user counts as deep in flow.
    #[serde(default = "default_deep_flow_threshold")]
    pub deep_flow_threshold: u8,
    /// How often the historical pattern recompute pass runs (minutes).
    #[serde(default = "default_recompute_interval")]
    pub recompute_interval_minutes: u64,
}

fn default_detection_window() -> i64 { 15 }
fn default_min_activity() -> u32 { 3 }
fn default_flow_threshold() -> u8 { 60 }
fn default_deep_flow_threshold() -> u8 { 80 }
fn default_recompute_interval() -> u64 { 30 }

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            detection_window_minutes: default_detection_window(),
            min_activity_for_flow: default_min_activity(),
            flow_threshold: default_flow_threshold(),
            deep_flow_threshold: default_deep_flow_threshold(),
            recompute_interval_minutes: default_recompute_interval(),
        }
    }
}

/// Queue scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between queue scans.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Max notifications pulled per scan.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

fn default_scan_interval() -> u64 { 30 }
fn default_scan_limit() -> usize { 50 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            scan_limit: default_scan_limit(),
        }
    }
}

/// Push delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Retry attempts per subscription before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry delay in seconds (doubles per attempt).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Transport request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u64 { 2 }
fn default_timeout() -> u64 { 10 }

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            timeout_secs: default_timeout(),
        }
    }
}
