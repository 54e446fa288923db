//! Quiet-hours evaluation — user-local daily windows, including ranges
//! that wrap past midnight.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use nudge_core::prefs::UserPreferences;
use nudge_core::types::QuietStatus;

/// Whether `now` falls inside the user's quiet hours, and when the
/// current window ends. Absent or unparseable configuration means the
/// user is never in quiet hours.
pub fn evaluate_quiet_hours(prefs: &UserPreferences, now: DateTime<Utc>) -> QuietStatus {
    let (Some(start_raw), Some(end_raw)) =
        (prefs.quiet_hours_start.as_deref(), prefs.quiet_hours_end.as_deref())
    else {
        return QuietStatus::clear();
    };
    let (Some(start), Some(end)) = (parse_hhmm(start_raw), parse_hhmm(end_raw)) else {
        tracing::warn!("⚠️ Unparseable quiet hours '{start_raw}'–'{end_raw}', ignoring");
        return QuietStatus::clear();
    };

    let tz: Tz = prefs.timezone.parse().unwrap_or(chrono_tz::UTC);
    let local = now.with_timezone(&tz);
    let t = local.time();

    if start <= end {
        // Same-day window, e.g. 13:00–14:00.
        if t >= start && t < end {
            QuietStatus {
                in_quiet_hours: true,
                ends_at: local_instant(&tz, local.date_naive(), end),
            }
        } else {
            QuietStatus::clear()
        }
    } else {
        // Overnight window, e.g. 22:00–08:00.
        if t >= start {
            // Evening side — ends tomorrow.
            QuietStatus {
                in_quiet_hours: true,
                ends_at: local_instant(&tz, local.date_naive() + Duration::days(1), end),
            }
        } else if t < end {
            // Morning side, already past midnight — ends today.
            QuietStatus {
                in_quiet_hours: true,
                ends_at: local_instant(&tz, local.date_naive(), end),
            }
        } else {
            QuietStatus::clear()
        }
    }
}

/// Resolve a local (date, time) to a UTC instant. DST gaps/folds resolve
/// to the earliest valid interpretation.
fn local_instant(tz: &Tz, date: chrono::NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse "HH:MM".
fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}
