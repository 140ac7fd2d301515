//! Running per-actor and per-target damage roll-ups for the flat
//! `parse` view (no encounter segmentation).

use crate::combat_log::{Event, EventKind};
use crate::encounter::duration_seconds_inclusive;
use chrono::{DateTime, FixedOffset};
use hashbrown::HashMap;

#[derive(Debug, Clone)]
pub struct ActorTotals {
    pub actor: String,
    pub melee: i64,
    pub non_melee: i64,
    pub total: i64,
    pub first_damage: Option<DateTime<FixedOffset>>,
    pub last_damage: Option<DateTime<FixedOffset>>,
    pub target_damage: HashMap<String, i64>,
}

impl ActorTotals {
    fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            melee: 0,
            non_melee: 0,
            total: 0,
            first_damage: None,
            last_damage: None,
            target_damage: HashMap::new(),
        }
    }

    /// Inclusive seconds between this actor's first and last damage.
    pub fn duration_seconds(&self) -> i64 {
        duration_seconds_inclusive(self.first_damage, self.last_damage)
    }

    pub fn dps(&self) -> f64 {
        let d = self.duration_seconds();
        if d <= 0 {
            return 0.0;
        }
        self.total as f64 / d as f64
    }
}

#[derive(Debug, Clone)]
pub struct TargetTotals {
    pub target: String,
    pub total: i64,
}

/// Accumulates amount-bearing outgoing damage by actor and by target.
#[derive(Debug, Default)]
pub struct DamageTotals {
    pub by_actor: HashMap<String, ActorTotals>,
    pub total_by_target: HashMap<String, i64>,
}

impl DamageTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, ev: &Event) {
        if !matches!(ev.kind, EventKind::MeleeDamage | EventKind::NonMeleeDamage) {
            return;
        }
        if !ev.amount_known {
            return;
        }

        let st = self
            .by_actor
            .entry(ev.actor.clone())
            .or_insert_with(|| ActorTotals::new(&ev.actor));

        st.first_damage = Some(match st.first_damage {
            Some(t) => t.min(ev.timestamp),
            None => ev.timestamp,
        });
        st.last_damage = Some(match st.last_damage {
            Some(t) => t.max(ev.timestamp),
            None => ev.timestamp,
        });

        match ev.kind {
            EventKind::MeleeDamage => st.melee += ev.amount,
            EventKind::NonMeleeDamage => st.non_melee += ev.amount,
            _ => {}
        }
        st.total += ev.amount;

        if !ev.target.is_empty() {
            *st.target_damage.entry(ev.target.clone()).or_insert(0) += ev.amount;
            *self.total_by_target.entry(ev.target.clone()).or_insert(0) += ev.amount;
        }
    }

    /// Actors by total desc, ties alphabetical.
    pub fn actors_sorted_by_total(&self) -> Vec<&ActorTotals> {
        let mut out: Vec<&ActorTotals> = self.by_actor.values().collect();
        out.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.actor.cmp(&b.actor)));
        out
    }

    /// Top `n` targets by accumulated damage (all targets when n == 0).
    pub fn top_targets(&self, n: usize) -> Vec<TargetTotals> {
        let mut out: Vec<TargetTotals> = self
            .total_by_target
            .iter()
            .map(|(target, total)| TargetTotals {
                target: target.clone(),
                total: *total,
            })
            .collect();
        out.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.target.cmp(&b.target)));
        if n > 0 && out.len() > n {
            out.truncate(n);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(secs, 0)
            .unwrap()
    }

    fn damage(secs: i64, kind: EventKind, actor: &str, target: &str, amount: i64) -> Event {
        let mut ev = Event::new(ts(secs));
        ev.kind = kind;
        ev.actor = actor.to_string();
        ev.target = target.to_string();
        ev.amount = amount;
        ev.amount_known = true;
        ev
    }

    #[test]
    fn test_totals_accumulate_by_kind() {
        let mut t = DamageTotals::new();
        t.process(&damage(100, EventKind::MeleeDamage, "A", "T", 10));
        t.process(&damage(101, EventKind::NonMeleeDamage, "A", "T", 5));

        let st = &t.by_actor["A"];
        assert_eq!(st.melee, 10);
        assert_eq!(st.non_melee, 5);
        assert_eq!(st.total, 15);
        assert_eq!(st.duration_seconds(), 2);
        assert_eq!(t.total_by_target["T"], 15);
    }

    #[test]
    fn test_totals_ignore_unknown_amounts_and_other_kinds() {
        let mut t = DamageTotals::new();
        let mut heal = damage(100, EventKind::Heal, "A", "T", 100);
        t.process(&heal);
        heal.kind = EventKind::MeleeDamage;
        heal.amount_known = false;
        t.process(&heal);
        assert!(t.by_actor.is_empty());
    }

    #[test]
    fn test_actor_duration_first_equals_last_is_one() {
        let mut t = DamageTotals::new();
        t.process(&damage(100, EventKind::MeleeDamage, "A", "T", 10));
        assert_eq!(t.by_actor["A"].duration_seconds(), 1);
    }

    #[test]
    fn test_top_targets_sorted_and_limited() {
        let mut t = DamageTotals::new();
        t.process(&damage(100, EventKind::MeleeDamage, "A", "a rat", 10));
        t.process(&damage(101, EventKind::MeleeDamage, "A", "a bat", 30));
        t.process(&damage(102, EventKind::MeleeDamage, "A", "a cat", 20));

        let top = t.top_targets(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].target, "a bat");
        assert_eq!(top[1].target, "a cat");
    }
}
