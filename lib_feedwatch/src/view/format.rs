//! Local-time rendering of event timestamps.

use chrono::{DateTime, TimeDelta, Utc};

/// Renders `ts` as `yyyy-MM-dd HH:mm:ss` shifted by `offset_hours`. Fractional
/// offsets (e.g. `5.5`) are rounded to the minute.
pub fn format_local(ts: &DateTime<Utc>, offset_hours: f64) -> String {
    let minutes = (offset_hours * 60.0).round() as i64;
    let shifted = TimeDelta::try_minutes(minutes)
        .and_then(|delta| ts.naive_utc().checked_add_signed(delta))
        .unwrap_or_else(|| ts.naive_utc());
    shifted.format("%Y-%m-%d %H:%M:%S").to_string()
}
