use super::{DamageBreakdownStats, Encounter, EncounterActorStats};
use crate::combat_log::{DamageClass, Event, EventKind};
use crate::identity::IdentityScore;
use chrono::{DateTime, Duration, FixedOffset};
use hashbrown::{HashMap, HashSet};

const IDENTITY_WINDOW_CAP: usize = 8192;
const IDENTITY_WINDOW_KEEP: usize = 4096;
const DAMAGE_WINDOW_CAP: usize = 20000;
const DAMAGE_WINDOW_KEEP: usize = 10000;

struct ActiveEncounter {
    enc: Encounter,
    last_ts: DateTime<FixedOffset>,
}

/// Online per-target encounter segmentation. Single-threaded: one
/// segmenter consumes exactly one parsed event stream.
pub struct EncounterSegmenter {
    pub idle_timeout: Duration,
    pub player_name: String,
    pub excluded_targets: HashSet<String>,

    pub(crate) local_touched_targets: HashSet<String>,
    pub(crate) combat_ts: Vec<DateTime<FixedOffset>>,
    pub(crate) identity_events: Vec<Event>,
    pub(crate) identity_dirty: bool,
    pub(crate) identity_scores: HashMap<String, IdentityScore>,
    pub(crate) recent_damage_events: Vec<Event>,

    active: HashMap<String, ActiveEncounter>,
    done: Vec<Encounter>,
}

impl EncounterSegmenter {
    pub fn new(idle_timeout: Duration, player_name: impl Into<String>) -> Self {
        let idle_timeout = if idle_timeout <= Duration::zero() {
            Duration::seconds(8)
        } else {
            idle_timeout
        };
        Self {
            idle_timeout,
            player_name: player_name.into(),
            excluded_targets: HashSet::new(),
            local_touched_targets: HashSet::new(),
            combat_ts: Vec::new(),
            identity_events: Vec::new(),
            identity_dirty: false,
            identity_scores: HashMap::new(),
            recent_damage_events: Vec::new(),
            active: HashMap::new(),
            done: Vec::new(),
        }
    }

    pub fn set_excluded_targets(&mut self, targets: HashSet<String>) {
        self.excluded_targets = targets;
    }

    /// Feed one event. Non-damage events only touch the side windows;
    /// eligible damage opens, extends or splits the target's encounter.
    pub fn process(&mut self, ev: &Event) {
        // Identity and time-series windows are additive; they never affect
        // segmentation itself.
        if ev.kind == EventKind::CastStart || is_encounter_damage_event(ev) {
            self.observe_identity_event(ev.clone());
        }
        if is_encounter_damage_event(ev) {
            self.recent_damage_events.push(ev.clone());
            if self.recent_damage_events.len() > DAMAGE_WINDOW_CAP {
                let n = self.recent_damage_events.len();
                self.recent_damage_events.drain(..n - DAMAGE_WINDOW_KEEP);
            }
            self.append_combat_timestamp(ev.timestamp);
        }
        if is_encounter_damage_event(ev)
            && is_valid_encounter_target(&ev.target)
            && !self.player_name.is_empty()
            && ev.target != self.player_name
            && (ev.actor == self.player_name || ev.actor == "YOU")
        {
            self.local_touched_targets.insert(ev.target.clone());
        }

        if !is_encounter_damage_event(ev) {
            return;
        }
        if !is_valid_encounter_target(&ev.target) {
            return;
        }
        if self.excluded_targets.contains(&ev.target) {
            return;
        }
        if !self.player_name.is_empty() && ev.target == self.player_name {
            return;
        }

        let ae = self
            .active
            .entry(ev.target.clone())
            .or_insert_with(|| ActiveEncounter {
                enc: Encounter::open(&ev.target, ev.timestamp),
                last_ts: ev.timestamp,
            });

        if ev.timestamp.signed_duration_since(ae.last_ts) > self.idle_timeout {
            let mut closed = std::mem::replace(
                &mut ae.enc,
                Encounter::open(&ev.target, ev.timestamp),
            );
            closed.end = ae.last_ts;
            ae.last_ts = ev.timestamp;
            self.done.push(closed);
        }

        let ae = self.active.get_mut(&ev.target).expect("active encounter");
        ae.last_ts = ev.timestamp;
        ae.enc.end = ev.timestamp;

        let st = ae
            .enc
            .by_actor
            .entry(ev.actor.clone())
            .or_insert_with(|| EncounterActorStats::new(&ev.actor));

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

        if ev.damage_class != DamageClass::Unknown {
            st.breakdown
                .entry(ev.damage_class)
                .or_insert_with(|| DamageBreakdownStats::new(ev.damage_class))
                .add_hit(ev.amount, ev.crit);
        }

        st.hits += 1;
        st.max_hit = st.max_hit.max(ev.amount);
        if ev.crit {
            st.crit_hits += 1;
            st.crit_dmg_sum += ev.amount;
        }
        st.total += ev.amount;
        ae.enc.total += ev.amount;
    }

    /// Close every active encounter and return the full ordered history.
    pub fn finalize(&mut self) -> Vec<Encounter> {
        for (_, mut ae) in self.active.drain() {
            ae.enc.end = ae.last_ts;
            self.done.push(ae.enc);
        }
        sort_by_start_then_target(&mut self.done);
        self.done.clone()
    }

    /// By-value view of done plus currently active encounters.
    pub fn snapshot(&self) -> Vec<Encounter> {
        let mut out: Vec<Encounter> = self.done.clone();
        out.extend(self.active.values().map(|ae| ae.enc.clone()));
        sort_by_start_then_target(&mut out);
        out
    }

    fn append_combat_timestamp(&mut self, ts: DateTime<FixedOffset>) {
        match self.combat_ts.last() {
            None => self.combat_ts.push(ts),
            Some(last) if ts >= *last => self.combat_ts.push(ts),
            _ => {
                let idx = self.combat_ts.partition_point(|t| *t < ts);
                self.combat_ts.insert(idx, ts);
            }
        }
    }
}

fn sort_by_start_then_target(encs: &mut [Encounter]) {
    encs.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.target.cmp(&b.target)));
}

pub(crate) fn is_encounter_damage_event(ev: &Event) -> bool {
    ev.amount_known && matches!(ev.kind, EventKind::MeleeDamage | EventKind::NonMeleeDamage)
}

/// Reject target strings that are really parse fragments or self-heals.
pub(crate) fn is_valid_encounter_target(target: &str) -> bool {
    if target.is_empty() {
        return false;
    }
    let lt = target.to_lowercase();
    if lt == "you" {
        return false;
    }
    if lt.starts_with("on ") {
        return false;
    }
    if lt == "by non-melee" {
        return false;
    }
    if lt.starts_with("by ") {
        return false;
    }
    if lt.contains("been healed") {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn ts(secs: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(secs, 0)
            .unwrap()
    }

    pub(crate) fn melee(secs: i64, actor: &str, target: &str, amount: i64) -> Event {
        let mut ev = Event::new(ts(secs));
        ev.kind = EventKind::MeleeDamage;
        ev.actor = actor.to_string();
        ev.target = target.to_string();
        ev.amount = amount;
        ev.amount_known = true;
        ev
    }

    fn seg() -> EncounterSegmenter {
        EncounterSegmenter::new(Duration::seconds(8), "")
    }

    #[test]
    fn test_idle_timeout_splits_encounters() {
        let mut s = seg();
        s.process(&melee(100, "Alice", "a rat", 10));
        s.process(&melee(105, "Alice", "a rat", 10));
        // 9s > 8s idle timeout: new encounter.
        s.process(&melee(114, "Alice", "a rat", 10));
        let encs = s.finalize();
        assert_eq!(encs.len(), 2);
        assert_eq!(encs[0].end, ts(105));
        assert_eq!(encs[1].start, ts(114));
    }

    #[test]
    fn test_within_idle_timeout_is_one_encounter() {
        let mut s = seg();
        s.process(&melee(100, "Alice", "a rat", 10));
        s.process(&melee(108, "Alice", "a rat", 10));
        let encs = s.finalize();
        assert_eq!(encs.len(), 1);
        assert_eq!(encs[0].total, 20);
    }

    #[test]
    fn test_invalid_targets_rejected() {
        for t in [
            "",
            "YOU",
            "you",
            "on YOU",
            "On Sigdis",
            "by non-melee",
            "By non-melee",
            "by DPS Machine",
            "Sigdis has been healed for 10 points.",
        ] {
            assert!(!is_valid_encounter_target(t), "expected invalid: {t:?}");
        }
        for t in ["a rat", "DPS Machine", "Innoruuk"] {
            assert!(is_valid_encounter_target(t), "expected valid: {t:?}");
        }
    }

    #[test]
    fn test_invalid_targets_produce_no_encounters() {
        let mut s = seg();
        for t in ["YOU", "on YOU", "by non-melee", "by X", "X has been healed for 1 points."] {
            s.process(&melee(100, "Alice", t, 10));
        }
        assert!(s.finalize().is_empty());
    }

    #[test]
    fn test_heal_and_incoming_do_not_affect_totals() {
        let mut s = seg();
        s.process(&melee(100, "Alice", "a rat", 10));
        s.process(&melee(101, "Alice", "a rat", 20));

        let mut heal = Event::new(ts(102));
        heal.kind = EventKind::Heal;
        heal.target = "a rat".to_string();
        heal.amount = 9999;
        heal.amount_known = true;
        s.process(&heal);

        let mut incoming = Event::new(ts(102));
        incoming.kind = EventKind::IncomingDamage;
        incoming.target = "YOU".to_string();
        incoming.amount = 9999;
        incoming.amount_known = true;
        s.process(&incoming);

        let encs = s.finalize();
        assert_eq!(encs.len(), 1);
        assert_eq!(encs[0].total, 30);
        assert_eq!(encs[0].end, ts(101));
    }

    #[test]
    fn test_heal_only_creates_no_encounters() {
        let mut s = seg();
        let mut heal = Event::new(ts(100));
        heal.kind = EventKind::Heal;
        heal.target = "Sigdis".to_string();
        heal.amount = 200;
        heal.amount_known = true;
        s.process(&heal);
        assert!(s.finalize().is_empty());
    }

    #[test]
    fn test_excluded_target_dropped() {
        let mut s = seg();
        s.set_excluded_targets(["Sigdis".to_string()].into_iter().collect());
        s.process(&melee(100, "a rat", "Sigdis", 10));
        assert!(s.finalize().is_empty());
    }

    #[test]
    fn test_self_target_guard() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "Emberval");
        s.process(&melee(100, "a rat", "Emberval", 10));
        assert!(s.finalize().is_empty());
    }

    #[test]
    fn test_local_touched_targets_tracked() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "Emberval");
        s.process(&melee(100, "YOU", "Sigdis", 10));
        s.process(&melee(101, "Genaenyu", "Oshiruk", 10));
        assert!(s.local_touched_targets.contains("Sigdis"));
        assert!(!s.local_touched_targets.contains("Oshiruk"));
    }

    #[test]
    fn test_crit_accumulation() {
        let mut s = seg();
        let mut ev = melee(100, "Alice", "a rat", 50);
        ev.crit = true;
        ev.damage_class = DamageClass::Slash;
        s.process(&ev);
        s.process(&melee(101, "Alice", "a rat", 10));

        let encs = s.finalize();
        let st = &encs[0].by_actor["Alice"];
        assert_eq!(st.hits, 2);
        assert_eq!(st.crit_hits, 1);
        assert_eq!(st.crit_dmg_sum, 50);
        assert_eq!(st.max_hit, 50);
        let slash = &st.breakdown[&DamageClass::Slash];
        assert_eq!(slash.hits, 1);
        assert_eq!(slash.crit_hits, 1);
        assert_eq!(slash.min_hit, 50);
    }

    #[test]
    fn test_snapshot_includes_active_and_done() {
        let mut s = seg();
        s.process(&melee(100, "Alice", "a rat", 10));
        s.process(&melee(120, "Alice", "a rat", 10)); // split: first done
        s.process(&melee(121, "Alice", "a bat", 5));
        let snap = s.snapshot();
        assert_eq!(snap.len(), 3);
        // Sorted by start asc, then target asc.
        assert_eq!(snap[0].start, ts(100));
        assert_eq!(snap[1].start, ts(120));
        assert_eq!(snap[1].target, "a rat");
        assert_eq!(snap[2].target, "a bat");
    }
}
