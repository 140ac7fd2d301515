//! Post-hoc merging of same-target encounter segments.
//!
//! An idle break is sometimes just the player peeling off to kill adds;
//! two segments of the same target merge when the gap between them is
//! short enough and the log shows combat against something during it.

use super::{Encounter, EncounterSegmenter};
use chrono::{DateTime, Duration, FixedOffset};
use hashbrown::HashMap;

pub(crate) const DEFAULT_COALESCE_MERGE_GAP: i64 = 90;

impl EncounterSegmenter {
    /// True when any eligible damage timestamp lies strictly between
    /// `start` and `end`.
    pub(crate) fn has_combat_between(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> bool {
        if end <= start || self.combat_ts.is_empty() {
            return false;
        }
        let start = start + Duration::nanoseconds(1);
        let end = end - Duration::nanoseconds(1);
        if end <= start {
            return false;
        }
        let idx = self.combat_ts.partition_point(|t| *t < start);
        match self.combat_ts.get(idx) {
            Some(t) => *t <= end,
            None => false,
        }
    }

    /// Merge same-target segments separated by at most `merge_gap`
    /// (default 90 s) when combat happened in the gap.
    pub(crate) fn coalesce_encounters(
        &self,
        encs: Vec<Encounter>,
        merge_gap: Duration,
    ) -> Vec<Encounter> {
        if encs.is_empty() {
            return encs;
        }
        let merge_gap = if merge_gap <= Duration::zero() {
            Duration::seconds(DEFAULT_COALESCE_MERGE_GAP)
        } else {
            merge_gap
        };

        let mut by_target: HashMap<String, Vec<Encounter>> = HashMap::new();
        for enc in encs {
            by_target.entry(enc.target.clone()).or_default().push(enc);
        }

        let mut out = Vec::new();
        for (_, mut group) in by_target {
            group.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.end.cmp(&b.end)));

            let mut cur: Option<Encounter> = None;
            for e in group {
                let Some(mut c) = cur.take() else {
                    cur = Some(e);
                    continue;
                };
                let gap = e.start.signed_duration_since(c.end);
                if gap > Duration::zero()
                    && gap <= merge_gap
                    && self.has_combat_between(c.end, e.start)
                {
                    c.merge(&e);
                    cur = Some(c);
                } else {
                    out.push(c);
                    cur = Some(e);
                }
            }
            if let Some(c) = cur {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::combat_log::{DamageClass, Event, EventKind};
    use crate::encounter::EncounterSegmenter;
    use crate::query::SnapshotOptions;
    use chrono::{DateTime, Duration, FixedOffset, TimeZone};

    fn ts(secs: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(secs, 0)
            .unwrap()
    }

    fn melee(secs: i64, actor: &str, target: &str, amount: i64) -> Event {
        let mut ev = Event::new(ts(secs));
        ev.kind = EventKind::MeleeDamage;
        ev.actor = actor.to_string();
        ev.target = target.to_string();
        ev.amount = amount;
        ev.amount_known = true;
        ev
    }

    fn opts_coalesced() -> SnapshotOptions {
        SnapshotOptions {
            include_pc_targets: true,
            limit_encounters: 0,
            coalesce_targets: true,
            coalesce_merge_gap: Duration::seconds(90),
        }
    }

    #[test]
    fn test_coalescing_merges_with_combat_between() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        s.process(&melee(100, "Alice", "Lord Soth", 10));
        s.process(&melee(101, "Alice", "Lord Soth", 10));
        // Gap combat against an add keeps the fight "alive".
        s.process(&melee(120, "Alice", "Fallen Knight of Soth", 5));
        s.process(&melee(140, "Alice", "Lord Soth", 20));
        s.process(&melee(141, "Alice", "Lord Soth", 20));

        let snap = s.build_snapshot(ts(200), "", false, &opts_coalesced());
        let soth: Vec<_> = snap
            .encounters
            .iter()
            .filter(|e| e.target == "Lord Soth")
            .collect();
        assert_eq!(soth.len(), 1);
        assert_eq!(soth[0].total_damage, 60);
        assert_eq!(soth[0].actors.len(), 1);
        assert_eq!(soth[0].actors[0].actor, "Alice");
        // First damage 100, last 141: 42 inclusive seconds.
        assert_eq!(soth[0].actors[0].active_sec, 42);
    }

    #[test]
    fn test_coalescing_does_not_merge_without_combat_between() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        s.process(&melee(100, "Alice", "Lord Soth", 10));
        s.process(&melee(101, "Alice", "Lord Soth", 10));
        s.process(&melee(140, "Alice", "Lord Soth", 20));
        s.process(&melee(141, "Alice", "Lord Soth", 20));

        let snap = s.build_snapshot(ts(200), "", false, &opts_coalesced());
        let soth = snap
            .encounters
            .iter()
            .filter(|e| e.target == "Lord Soth")
            .count();
        assert_eq!(soth, 2);
    }

    #[test]
    fn test_coalescing_off_returns_raw_segments() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        s.process(&melee(100, "Alice", "Lord Soth", 10));
        s.process(&melee(120, "Alice", "Fallen Knight of Soth", 5));
        s.process(&melee(140, "Alice", "Lord Soth", 20));

        let opts = SnapshotOptions {
            coalesce_targets: false,
            include_pc_targets: true,
            ..Default::default()
        };
        let snap = s.build_snapshot(ts(200), "", false, &opts);
        let soth = snap
            .encounters
            .iter()
            .filter(|e| e.target == "Lord Soth")
            .count();
        assert_eq!(soth, 2);
    }

    #[test]
    fn test_merge_respects_gap_limit() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        s.process(&melee(100, "Alice", "Lord Soth", 10));
        // Combat in gap, but the gap itself exceeds the merge window.
        s.process(&melee(150, "Alice", "Fallen Knight of Soth", 5));
        s.process(&melee(300, "Alice", "Lord Soth", 20));

        let snap = s.build_snapshot(ts(400), "", false, &opts_coalesced());
        let soth = snap
            .encounters
            .iter()
            .filter(|e| e.target == "Lord Soth")
            .count();
        assert_eq!(soth, 2);
    }

    #[test]
    fn test_merged_breakdown_min_hit_skips_zero() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        let mut a = melee(100, "Alice", "Lord Soth", 40);
        a.damage_class = DamageClass::Slash;
        s.process(&a);
        s.process(&melee(120, "Alice", "an add", 5));
        let mut b = melee(140, "Alice", "Lord Soth", 25);
        b.damage_class = DamageClass::Slash;
        s.process(&b);

        let view = s
            .get_damage_breakdown_by_key(
                &format!("Lord Soth|{}", ts(100).timestamp_millis()),
                "Alice",
            )
            .expect("breakdown");
        let slash = view
            .rows
            .iter()
            .find(|r| r.name == "Slashes")
            .expect("slash row");
        assert_eq!(slash.min_hit, 25);
        assert_eq!(slash.max_hit, 40);
        assert_eq!(slash.hits, 2);
    }
}
