//! Analytic projections over the segmenter's encounter history.

mod breakdown;
mod snapshot;
mod time_series;

pub use breakdown::{DamageBreakdownRowView, DamageBreakdownView};
pub use snapshot::{ActorStatsView, EncounterView, Snapshot};
pub use time_series::{PlayerBucket, PlayersSeries, SeriesMode};

use chrono::{DateTime, Duration, FixedOffset};

/// Snapshot shaping options.
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub include_pc_targets: bool,
    pub limit_encounters: usize,
    pub coalesce_targets: bool,
    pub coalesce_merge_gap: Duration,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            include_pc_targets: false,
            limit_encounters: 0,
            coalesce_targets: false,
            coalesce_merge_gap: Duration::seconds(
                crate::encounter::coalesce_default_merge_gap_secs(),
            ),
        }
    }
}

/// Stable encounter handle: survives recomputation as long as the start
/// does.
pub fn encounter_key(target: &str, start: DateTime<FixedOffset>) -> String {
    format!("{}|{}", target, start.timestamp_millis())
}

/// Display-only identifier; embeds the end so it changes as the
/// encounter extends. Use [`encounter_key`] for stable references.
pub fn encounter_id(
    target: &str,
    start: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
) -> String {
    format!("{}|{}|{}", target, start.to_rfc3339(), end.to_rfc3339())
}

pub(crate) fn parse_encounter_key(key: &str) -> Option<(&str, i64)> {
    let parts: Vec<&str> = key.split('|').collect();
    if parts.len() != 2 {
        return None;
    }
    let start_ms = parts[1].parse::<i64>().ok()?;
    Some((parts[0], start_ms))
}

pub(crate) fn parse_encounter_id(
    id: &str,
) -> Option<(&str, DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    let parts: Vec<&str> = id.split('|').collect();
    if parts.len() != 3 {
        return None;
    }
    let start = DateTime::parse_from_rfc3339(parts[1]).ok()?;
    let end = DateTime::parse_from_rfc3339(parts[2]).ok()?;
    Some((parts[0], start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encounter_key_round_trip() {
        let start = FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(100, 0)
            .unwrap();
        let key = encounter_key("Lord Soth", start);
        assert_eq!(key, "Lord Soth|100000");
        let (target, ms) = parse_encounter_key(&key).unwrap();
        assert_eq!(target, "Lord Soth");
        assert_eq!(ms, 100_000);
    }

    #[test]
    fn test_encounter_id_round_trip() {
        let tz = FixedOffset::east_opt(0).unwrap();
        let start = tz.timestamp_opt(100, 0).unwrap();
        let end = tz.timestamp_opt(140, 0).unwrap();
        let id = encounter_id("Lord Soth", start, end);
        let (target, s, e) = parse_encounter_id(&id).unwrap();
        assert_eq!(target, "Lord Soth");
        assert_eq!(s, start);
        assert_eq!(e, end);
    }

    #[test]
    fn test_malformed_handles_rejected() {
        assert!(parse_encounter_key("no-separator").is_none());
        assert!(parse_encounter_key("a|b|c").is_none());
        assert!(parse_encounter_key("a|not-a-number").is_none());
        assert!(parse_encounter_id("a|b").is_none());
        assert!(parse_encounter_id("a|bad|worse").is_none());
    }
}
