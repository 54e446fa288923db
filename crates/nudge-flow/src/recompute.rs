//! Periodic pattern recompute — derives a stored flow score per
//! (user, hour, weekday) slot so live scoring reads one number instead of
//! re-aggregating raw samples on every request.
//!
//! Uses the scorer's canonical weights with a neutral historical term;
//! there is deliberately no second formula.

use std::sync::Arc;

use chrono::{Duration, Utc};

use nudge_core::error::Result;

use crate::scorer::{self, MIN_PATTERN_SAMPLES};
use crate::store::FlowDb;

/// Recompute stored flow scores for all patterns with enough samples and
/// prune samples older than 24h. Returns how many patterns were updated.
pub fn recompute_patterns(db: &FlowDb, min_activity_for_flow: u32) -> Result<usize> {
    let patterns = db.patterns_with_min_samples(MIN_PATTERN_SAMPLES)?;
    let mut updated = 0;
    for p in &patterns {
        let density = scorer::activity_score(p.avg_messages.round().max(0.0) as u32, min_activity_for_flow);
        let latency = scorer::latency_score(p.avg_latency_secs);
        let score = 0.50 * density + 0.30 * latency + 0.20 * 50.0;
        db.set_pattern_score(&p.user_id, p.hour, p.weekday, score)?;
        updated += 1;
    }

    let pruned = db.prune_samples(Utc::now() - Duration::hours(24))?;
    if updated > 0 || pruned > 0 {
        tracing::debug!("🧠 Recomputed {updated} patterns, pruned {pruned} samples");
    }
    Ok(updated)
}

/// Spawn the recompute pass as a background tokio task.
pub async fn spawn_recompute(db: Arc<FlowDb>, interval_minutes: u64, min_activity_for_flow: u32) {
    tracing::info!("🧠 Pattern recompute started (every {interval_minutes}m)");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(interval_minutes * 60));
    loop {
        interval.tick().await;
        if let Err(e) = recompute_patterns(&db, min_activity_for_flow) {
            tracing::warn!("⚠️ Pattern recompute failed: {e}");
        }
    }
}
