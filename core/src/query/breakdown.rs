use super::{encounter_id, parse_encounter_id, parse_encounter_key};
use crate::combat_log::DamageClass;
use crate::encounter::{duration_seconds_inclusive, Encounter, EncounterSegmenter};
use chrono::{DateTime, Duration, FixedOffset};
use serde::Serialize;

/// One damage-class row of an actor's encounter breakdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageBreakdownRowView {
    pub name: &'static str,
    pub pct_player: f64,
    pub damage: i64,
    #[serde(rename = "dpsEncounter")]
    pub dps: f64,
    pub sdps: f64,
    pub sec: i64,
    pub hits: i64,
    pub max_hit: i64,
    pub min_hit: i64,
    pub avg_hit: f64,
    pub crit_pct: f64,
    pub avg_crit: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageBreakdownView {
    pub encounter_id: String,
    pub target: String,
    pub actor: String,
    pub rows: Vec<DamageBreakdownRowView>,
}

impl EncounterSegmenter {
    /// Per-damage-class breakdown addressed by the stable encounter key.
    pub fn get_damage_breakdown_by_key(
        &self,
        encounter_key: &str,
        actor: &str,
    ) -> Option<DamageBreakdownView> {
        let (target, start_ms) = parse_encounter_key(encounter_key)?;
        if actor.is_empty() {
            return None;
        }
        let enc = self.find_encounter_by_key(target, start_ms)?;
        breakdown_view(&enc, actor)
    }

    /// Per-damage-class breakdown addressed by the display identifier
    /// (`target|start|end`).
    pub fn get_damage_breakdown(
        &self,
        encounter_id: &str,
        actor: &str,
    ) -> Option<DamageBreakdownView> {
        let (target, start, end) = parse_encounter_id(encounter_id)?;
        if actor.is_empty() {
            return None;
        }
        let enc = self.find_encounter_exact(target, start, end)?;
        breakdown_view(&enc, actor)
    }

    /// Latest-ending encounter matching (target, start). Falls back to the
    /// coalesced view so handles taken from a merged encounter list still
    /// resolve.
    fn find_encounter_by_key(&self, target: &str, start_ms: i64) -> Option<Encounter> {
        let encs = self.snapshot();
        let best = encs
            .iter()
            .filter(|e| e.target == target && e.start.timestamp_millis() == start_ms)
            .max_by_key(|e| e.end)
            .cloned();
        if best.is_some() {
            return best;
        }

        let coalesced = self.coalesce_encounters(encs, Duration::zero());
        coalesced
            .into_iter()
            .filter(|e| e.target == target && e.start.timestamp_millis() == start_ms)
            .max_by_key(|e| e.end)
    }

    fn find_encounter_exact(
        &self,
        target: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Option<Encounter> {
        let encs = self.snapshot();
        let found = encs
            .iter()
            .find(|e| e.target == target && e.start == start && e.end == end)
            .cloned();
        if found.is_some() {
            return found;
        }

        // A coalesced identifier never matches a base segment; search the
        // merged view too.
        let coalesced = self.coalesce_encounters(encs, Duration::zero());
        coalesced
            .into_iter()
            .find(|e| e.target == target && e.start == start && e.end == end)
    }
}

fn breakdown_view(enc: &Encounter, actor: &str) -> Option<DamageBreakdownView> {
    let st = enc.by_actor.get(actor)?;

    let enc_sec = enc.duration_seconds();
    let active_sec = duration_seconds_inclusive(st.first_damage, st.last_damage);
    let actor_total = st.total;

    let mut rows: Vec<DamageBreakdownRowView> = Vec::with_capacity(st.breakdown.len());
    for class in DamageClass::BREAKDOWN_ORDER {
        let Some(agg) = st.breakdown.get(&class) else {
            continue;
        };
        if agg.hits <= 0 {
            continue;
        }

        let pct_player = if actor_total > 0 {
            agg.total_damage as f64 / actor_total as f64 * 100.0
        } else {
            0.0
        };
        let dps = if enc_sec > 0 {
            agg.total_damage as f64 / enc_sec as f64
        } else {
            0.0
        };
        let sdps = if active_sec > 0 {
            agg.total_damage as f64 / active_sec as f64
        } else {
            0.0
        };
        let avg_hit = if agg.hits > 0 {
            agg.total_damage as f64 / agg.hits as f64
        } else {
            0.0
        };
        let crit_pct = if agg.hits > 0 {
            agg.crit_hits as f64 / agg.hits as f64 * 100.0
        } else {
            0.0
        };
        let avg_crit = if agg.crit_hits > 0 {
            agg.crit_damage as f64 / agg.crit_hits as f64
        } else {
            0.0
        };

        rows.push(DamageBreakdownRowView {
            name: agg.name,
            pct_player,
            damage: agg.total_damage,
            dps,
            sdps,
            sec: active_sec,
            hits: agg.hits,
            max_hit: agg.max_hit,
            min_hit: agg.min_hit,
            avg_hit,
            crit_pct,
            avg_crit,
        });
    }

    rows.sort_by(|a, b| b.damage.cmp(&a.damage).then_with(|| a.name.cmp(b.name)));

    Some(DamageBreakdownView {
        encounter_id: encounter_id(&enc.target, enc.start, enc.end),
        target: enc.target.clone(),
        actor: actor.to_string(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat_log::{Event, EventKind};
    use crate::query::encounter_key;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(secs, 0)
            .unwrap()
    }

    fn damage(
        secs: i64,
        kind: EventKind,
        class: DamageClass,
        amount: i64,
        crit: bool,
    ) -> Event {
        let mut ev = Event::new(ts(secs));
        ev.kind = kind;
        ev.damage_class = class;
        ev.actor = "Alice".to_string();
        ev.target = "a rat".to_string();
        ev.amount = amount;
        ev.amount_known = true;
        ev.crit = crit;
        ev
    }

    fn build_segmenter() -> EncounterSegmenter {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        s.process(&damage(100, EventKind::MeleeDamage, DamageClass::Pierce, 100, false));
        s.process(&damage(101, EventKind::MeleeDamage, DamageClass::Pierce, 150, false));
        s.process(&damage(102, EventKind::MeleeDamage, DamageClass::Slash, 200, true));
        s.process(&damage(103, EventKind::NonMeleeDamage, DamageClass::Direct, 50, false));
        s
    }

    #[test]
    fn test_breakdown_rows_sorted_by_damage_desc() {
        let s = build_segmenter();
        let key = encounter_key("a rat", ts(100));
        let view = s.get_damage_breakdown_by_key(&key, "Alice").expect("view");

        assert_eq!(view.rows.len(), 3);
        assert_eq!(view.rows[0].name, "Pierces");
        assert_eq!(view.rows[0].hits, 2);
        assert_eq!(view.rows[0].min_hit, 100);
        assert_eq!(view.rows[0].max_hit, 150);
        assert_eq!(view.rows[0].damage, 250);

        assert_eq!(view.rows[1].name, "Slashes");
        assert_eq!(view.rows[1].hits, 1);
        assert_eq!(view.rows[1].crit_pct, 100.0);
        assert_eq!(view.rows[1].avg_crit, 200.0);
        assert_eq!(view.rows[1].damage, 200);

        assert_eq!(view.rows[2].name, "Direct Damage");
        assert_eq!(view.rows[2].damage, 50);

        let pct_sum: f64 = view.rows.iter().map(|r| r.pct_player).sum();
        assert!((pct_sum - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_breakdown_by_display_id() {
        let s = build_segmenter();
        let id = encounter_id("a rat", ts(100), ts(103));
        let view = s.get_damage_breakdown(&id, "Alice").expect("view");
        assert_eq!(view.target, "a rat");
        assert_eq!(view.actor, "Alice");
        assert_eq!(view.rows.len(), 3);
    }

    #[test]
    fn test_breakdown_missing_actor_is_none() {
        let s = build_segmenter();
        let key = encounter_key("a rat", ts(100));
        assert!(s.get_damage_breakdown_by_key(&key, "Nobody").is_none());
        assert!(s.get_damage_breakdown_by_key(&key, "").is_none());
        assert!(s.get_damage_breakdown_by_key("bogus", "Alice").is_none());
    }

    #[test]
    fn test_unknown_class_not_in_breakdown() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        // Frenzy-style melee without a class mapping.
        s.process(&damage(100, EventKind::MeleeDamage, DamageClass::Unknown, 40, false));
        s.process(&damage(101, EventKind::MeleeDamage, DamageClass::Slash, 10, false));

        let key = encounter_key("a rat", ts(100));
        let view = s.get_damage_breakdown_by_key(&key, "Alice").expect("view");
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].name, "Slashes");
    }
}
