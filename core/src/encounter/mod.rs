//! Per-target encounter state and roll-ups.

mod coalesce;
mod segmenter;

pub use segmenter::EncounterSegmenter;

pub(crate) fn coalesce_default_merge_gap_secs() -> i64 {
    coalesce::DEFAULT_COALESCE_MERGE_GAP
}

use crate::combat_log::DamageClass;
use chrono::{DateTime, FixedOffset};
use hashbrown::HashMap;

/// Per-damage-class aggregate inside one actor's encounter stats.
#[derive(Debug, Clone)]
pub struct DamageBreakdownStats {
    pub class: DamageClass,
    pub name: &'static str,
    pub hits: i64,
    pub crit_hits: i64,
    pub total_damage: i64,
    pub min_hit: i64,
    pub max_hit: i64,
    pub crit_damage: i64,
}

impl DamageBreakdownStats {
    fn new(class: DamageClass) -> Self {
        Self {
            class,
            name: class.display_name(),
            hits: 0,
            crit_hits: 0,
            total_damage: 0,
            min_hit: 0,
            max_hit: 0,
            crit_damage: 0,
        }
    }

    fn add_hit(&mut self, amount: i64, crit: bool) {
        if self.hits == 0 {
            self.min_hit = amount;
            self.max_hit = amount;
        } else {
            self.min_hit = self.min_hit.min(amount);
            self.max_hit = self.max_hit.max(amount);
        }
        self.hits += 1;
        self.total_damage += amount;
        if crit {
            self.crit_hits += 1;
            self.crit_damage += amount;
        }
    }

    fn merge(&mut self, other: &DamageBreakdownStats) {
        self.hits += other.hits;
        self.crit_hits += other.crit_hits;
        self.total_damage += other.total_damage;
        self.crit_damage += other.crit_damage;
        if self.min_hit == 0 || (other.min_hit > 0 && other.min_hit < self.min_hit) {
            self.min_hit = other.min_hit;
        }
        self.max_hit = self.max_hit.max(other.max_hit);
    }
}

/// One actor's accumulated damage within an encounter.
#[derive(Debug, Clone)]
pub struct EncounterActorStats {
    pub actor: String,
    pub melee: i64,
    pub non_melee: i64,
    pub total: i64,
    pub breakdown: HashMap<DamageClass, DamageBreakdownStats>,
    pub hits: i64,
    pub crit_hits: i64,
    pub max_hit: i64,
    pub crit_dmg_sum: i64,
    pub first_damage: Option<DateTime<FixedOffset>>,
    pub last_damage: Option<DateTime<FixedOffset>>,
}

impl EncounterActorStats {
    fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            melee: 0,
            non_melee: 0,
            total: 0,
            breakdown: HashMap::new(),
            hits: 0,
            crit_hits: 0,
            max_hit: 0,
            crit_dmg_sum: 0,
            first_damage: None,
            last_damage: None,
        }
    }

    /// Inclusive seconds between first and last damage, floored at 1.
    pub fn active_seconds(&self) -> i64 {
        duration_seconds_inclusive(self.first_damage, self.last_damage)
    }

    fn merge(&mut self, other: &EncounterActorStats) {
        self.melee += other.melee;
        self.non_melee += other.non_melee;
        self.total += other.total;
        self.hits += other.hits;
        self.crit_hits += other.crit_hits;
        self.crit_dmg_sum += other.crit_dmg_sum;
        self.max_hit = self.max_hit.max(other.max_hit);
        self.first_damage = match (self.first_damage, other.first_damage) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_damage = match (self.last_damage, other.last_damage) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (class, agg) in &other.breakdown {
            match self.breakdown.get_mut(class) {
                Some(existing) => existing.merge(agg),
                None => {
                    self.breakdown.insert(*class, agg.clone());
                }
            }
        }
    }
}

/// A maximal contiguous run of damage against one target.
#[derive(Debug, Clone)]
pub struct Encounter {
    pub target: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub by_actor: HashMap<String, EncounterActorStats>,
    pub total: i64,
}

impl Encounter {
    fn open(target: impl Into<String>, start: DateTime<FixedOffset>) -> Self {
        Self {
            target: target.into(),
            start,
            end: start,
            by_actor: HashMap::new(),
            total: 0,
        }
    }

    /// Inclusive encounter seconds, floored at 1.
    pub fn duration_seconds(&self) -> i64 {
        duration_seconds_inclusive(Some(self.start), Some(self.end))
    }

    pub fn dps(&self) -> f64 {
        let d = self.duration_seconds();
        if d <= 0 {
            return 0.0;
        }
        self.total as f64 / d as f64
    }

    /// Actors by total desc, ties broken alphabetically.
    pub fn actors_sorted_by_total(&self) -> Vec<&EncounterActorStats> {
        let mut out: Vec<&EncounterActorStats> = self.by_actor.values().collect();
        out.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.actor.cmp(&b.actor)));
        out
    }

    fn merge(&mut self, other: &Encounter) {
        self.end = other.end;
        self.total += other.total;
        for (actor, st) in &other.by_actor {
            match self.by_actor.get_mut(actor) {
                Some(existing) => existing.merge(st),
                None => {
                    self.by_actor.insert(actor.clone(), st.clone());
                }
            }
        }
    }
}

/// Inclusive whole seconds between two instants: a shared timestamp counts
/// as one second, a one-second spread counts as two.
pub(crate) fn duration_seconds_inclusive(
    start: Option<DateTime<FixedOffset>>,
    end: Option<DateTime<FixedOffset>>,
) -> i64 {
    let (Some(start), Some(end)) = (start, end) else {
        return 0;
    };
    let d = end.signed_duration_since(start);
    if d < chrono::Duration::zero() {
        return 0;
    }
    (d.num_seconds() + 1).max(1)
}
