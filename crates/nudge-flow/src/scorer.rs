//! Flow scorer — fuses activity density, response latency, and learned
//! hour-of-week patterns into a single 0–100 score.
//!
//! A manual focus override supersedes the computed score entirely while
//! active. Absent data degrades to neutral values; scoring never fails on
//! missing signals.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use nudge_core::config::FlowConfig;
use nudge_core::error::Result;
use nudge_core::traits::FlowSignalSource;
use nudge_core::types::{FlowComponents, FlowOverride, FlowScore};

use crate::store::FlowDb;

/// Fusion weights. The historical score stored by the recompute pass uses
/// the same weights with a neutral historical term, so there is exactly
/// one formula in the system.
const WEIGHT_ACTIVITY: f64 = 0.50;
const WEIGHT_RESPONSE: f64 = 0.30;
const WEIGHT_HISTORICAL: f64 = 0.20;

/// Patterns need this many observations before they influence scoring.
pub const MIN_PATTERN_SAMPLES: u32 = 5;

pub struct FlowScorer {
    db: Arc<FlowDb>,
    config: FlowConfig,
}

impl FlowScorer {
    pub fn new(db: Arc<FlowDb>, config: FlowConfig) -> Self {
        Self { db, config }
    }

    /// Record one activity sample (a user message, optionally with the
    /// latency of the reply it answered) and fold it into the matching
    /// hour-of-week pattern.
    pub fn record_activity(&self, user_id: &str, response_latency_secs: Option<f64>) -> Result<()> {
        let now = Utc::now();
        self.db.record_sample(user_id, response_latency_secs, now)?;

        // Density observation: how many samples the detection window holds
        // right now, including this one.
        let since = now - Duration::minutes(self.config.detection_window_minutes);
        let (count, _) = self.db.window_stats(user_id, since)?;
        self.db.observe_pattern(
            user_id,
            now.hour() as u8,
            now.weekday().num_days_from_monday() as u8,
            count as f64,
            response_latency_secs,
        )?;
        Ok(())
    }

    /// Pin the user as focusing for the next `minutes` minutes.
    pub fn set_override(&self, user_id: &str, minutes: i64) -> Result<DateTime<Utc>> {
        let until = Utc::now() + Duration::minutes(minutes);
        self.db.set_override(user_id, until)?;
        tracing::info!("🧘 Focus override set for {user_id} until {until}");
        Ok(until)
    }

    /// Drop the user's focus override.
    pub fn clear_override(&self, user_id: &str) -> Result<()> {
        self.db.clear_override(user_id)
    }

    /// Active override, if any (lazily expired).
    pub fn get_override(&self, user_id: &str) -> Result<Option<FlowOverride>> {
        self.db.get_override(user_id, Utc::now())
    }

    /// Compute the fused flow score for a user right now.
    pub fn score_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<FlowScore> {
        // Manual override wins outright.
        if let Some(ov) = self.db.get_override(user_id, now)? {
            if ov.is_focusing {
                return Ok(FlowScore {
                    score: 100,
                    in_flow: true,
                    deep_flow: true,
                    source: "manual_override".into(),
                    components: FlowComponents::default(),
                    estimated_end: Some(ov.until),
                });
            }
        }

        let since = now - Duration::minutes(self.config.detection_window_minutes);
        let (count, avg_latency) = self.db.window_stats(user_id, since)?;

        let activity = activity_score(count, self.config.min_activity_for_flow);
        let response = latency_score(avg_latency);
        let historical = self
            .db
            .get_pattern(
                user_id,
                now.hour() as u8,
                now.weekday().num_days_from_monday() as u8,
            )?
            .filter(|p| p.sample_count >= MIN_PATTERN_SAMPLES)
            .map(|p| p.flow_score)
            .unwrap_or(50.0);

        let fused = WEIGHT_ACTIVITY * activity + WEIGHT_RESPONSE * response
            + WEIGHT_HISTORICAL * historical;
        let score = fused.round().clamp(0.0, 100.0) as u8;

        Ok(FlowScore {
            score,
            in_flow: score >= self.config.flow_threshold,
            deep_flow: score >= self.config.deep_flow_threshold,
            source: "computed".into(),
            components: FlowComponents { activity, response, historical },
            estimated_end: None,
        })
    }
}

#[async_trait]
impl FlowSignalSource for FlowScorer {
    async fn score(&self, user_id: &str) -> Result<FlowScore> {
        self.score_at(user_id, Utc::now())
    }
}

/// Activity density component: ramps to 50 below the flow threshold,
/// 50–100 above it.
pub(crate) fn activity_score(count: u32, min_for_flow: u32) -> f64 {
    let min = min_for_flow.max(1) as f64;
    let count = count as f64;
    if count >= min {
        (50.0 + 50.0 * count / min).min(100.0)
    } else {
        50.0 * count / min
    }
}

/// Response latency component, tiered: fast replies read as engagement.
pub(crate) fn latency_score(avg_latency_secs: Option<f64>) -> f64 {
    match avg_latency_secs {
        Some(avg) if avg < 30.0 => 100.0,
        Some(avg) if avg < 60.0 => 80.0,
        Some(avg) if avg < 180.0 => 50.0,
        Some(avg) if avg < 300.0 => 30.0,
        Some(_) => 10.0,
        None => 0.0,
    }
}
