use super::{encounter_id, encounter_key, SnapshotOptions};
use crate::combat_log::{Event, EventKind};
use crate::encounter::{Encounter, EncounterSegmenter};
use crate::identity::{classify_names, IdentityClass, IdentityScore};
use chrono::{DateTime, FixedOffset};
use hashbrown::{HashMap, HashSet};
use serde::Serialize;

/// Per-actor derived statistics inside an [`EncounterView`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorStatsView {
    pub actor: String,
    pub melee: i64,
    pub non_melee: i64,
    pub total: i64,
    #[serde(rename = "dpsEncounter")]
    pub dps: f64,
    pub sdps: f64,
    pub active_sec: i64,
    pub pct_total: f64,
    pub hits: i64,
    pub max_hit: i64,
    pub avg_hit: f64,
    pub crit_pct: f64,
    pub avg_crit: f64,
    pub crits: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterView {
    pub encounter_key: String,
    pub encounter_id: String,
    pub target: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub encounter_sec: i64,
    pub total_damage: i64,
    pub dps_encounter: f64,
    pub actors: Vec<ActorStatsView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub now: DateTime<FixedOffset>,
    pub file_path: String,
    pub tailing: bool,
    pub encounter_count: usize,
    pub encounters: Vec<EncounterView>,
}

impl EncounterSegmenter {
    /// Ordered analytic view over the current encounter history:
    /// most-recent-end first, PC targets filtered per options, optional
    /// target coalescing, optional row limit.
    pub fn build_snapshot(
        &self,
        now: DateTime<FixedOffset>,
        file_path: &str,
        tailing: bool,
        opts: &SnapshotOptions,
    ) -> Snapshot {
        let filtered = self.filtered_encounters(opts);
        Snapshot {
            now,
            file_path: file_path.to_string(),
            tailing,
            encounter_count: filtered.len(),
            encounters: filtered.iter().map(encounter_view).collect(),
        }
    }

    /// Like [`build_snapshot`](Self::build_snapshot) without per-actor
    /// rows. Cheap enough for tight polling loops.
    pub fn build_snapshot_summary(
        &self,
        now: DateTime<FixedOffset>,
        file_path: &str,
        tailing: bool,
        opts: &SnapshotOptions,
    ) -> Snapshot {
        let filtered = self.filtered_encounters(opts);
        Snapshot {
            now,
            file_path: file_path.to_string(),
            tailing,
            encounter_count: filtered.len(),
            encounters: filtered
                .iter()
                .map(|enc| {
                    let mut view = encounter_header(enc);
                    view.actors = Vec::new();
                    view
                })
                .collect(),
        }
    }

    /// Single-encounter view addressed by the stable key. When several
    /// rows share the start (a raw segment and its coalesced extension),
    /// the one with the latest end wins.
    pub fn build_encounter_view_by_key(
        &self,
        opts: &SnapshotOptions,
        target: &str,
        start_ms: i64,
    ) -> Option<EncounterView> {
        let filtered = self.filtered_encounters(opts);
        let best = filtered
            .iter()
            .filter(|e| e.target == target && e.start.timestamp_millis() == start_ms)
            .max_by_key(|e| e.end)?;
        Some(encounter_view(best))
    }

    pub(crate) fn filtered_encounters(&self, opts: &SnapshotOptions) -> Vec<Encounter> {
        let mut encs = self.snapshot();
        if encs.is_empty() {
            return encs;
        }
        sort_most_recent_first(&mut encs);
        let mut filtered = filter_encounters_for_snapshot(
            encs,
            opts.include_pc_targets,
            &self.local_touched_targets,
        );
        if opts.coalesce_targets {
            filtered = self.coalesce_encounters(filtered, opts.coalesce_merge_gap);
            sort_most_recent_first(&mut filtered);
        }
        if opts.limit_encounters > 0 && filtered.len() > opts.limit_encounters {
            filtered.truncate(opts.limit_encounters);
        }
        filtered
    }
}

fn encounter_header(enc: &Encounter) -> EncounterView {
    let enc_sec = enc.duration_seconds();
    let dps_enc = if enc_sec > 0 {
        enc.total as f64 / enc_sec as f64
    } else {
        0.0
    };
    EncounterView {
        encounter_key: encounter_key(&enc.target, enc.start),
        encounter_id: encounter_id(&enc.target, enc.start, enc.end),
        target: enc.target.clone(),
        start: enc.start,
        end: enc.end,
        encounter_sec: enc_sec,
        total_damage: enc.total,
        dps_encounter: dps_enc,
        actors: Vec::new(),
    }
}

fn encounter_view(enc: &Encounter) -> EncounterView {
    let mut view = encounter_header(enc);
    let enc_sec = view.encounter_sec;

    view.actors = enc
        .actors_sorted_by_total()
        .into_iter()
        .map(|st| {
            let active_sec = st.active_seconds();
            let dps = if enc_sec > 0 {
                st.total as f64 / enc_sec as f64
            } else {
                0.0
            };
            let sdps = if active_sec > 0 {
                st.total as f64 / active_sec as f64
            } else {
                0.0
            };
            let pct_total = if enc.total > 0 {
                st.total as f64 / enc.total as f64 * 100.0
            } else {
                0.0
            };
            let avg_hit = if st.hits > 0 {
                st.total as f64 / st.hits as f64
            } else {
                0.0
            };
            let crit_pct = if st.hits > 0 {
                st.crit_hits as f64 / st.hits as f64 * 100.0
            } else {
                0.0
            };
            let avg_crit = if st.crit_hits > 0 {
                st.crit_dmg_sum as f64 / st.crit_hits as f64
            } else {
                0.0
            };
            ActorStatsView {
                actor: st.actor.clone(),
                melee: st.melee,
                non_melee: st.non_melee,
                total: st.total,
                dps,
                sdps,
                active_sec,
                pct_total,
                hits: st.hits,
                max_hit: st.max_hit,
                avg_hit,
                crit_pct,
                avg_crit,
                crits: st.crit_hits,
            }
        })
        .collect();

    view
}

fn sort_most_recent_first(encs: &mut [Encounter]) {
    encs.sort_by(|a, b| {
        b.end
            .cmp(&a.end)
            .then_with(|| b.start.cmp(&a.start))
            .then_with(|| a.target.cmp(&b.target))
    });
}

fn filter_encounters_for_snapshot(
    encs: Vec<Encounter>,
    include_pc_targets: bool,
    local_touched_targets: &HashSet<String>,
) -> Vec<Encounter> {
    if include_pc_targets {
        return encs;
    }
    let scores = classify_names_from_encounters(&encs);
    encs.into_iter()
        .filter(|e| {
            match scores.get(&e.target) {
                Some(sc) if sc.class == IdentityClass::LikelyPC => {
                    // A PC target the local player deliberately engaged
                    // stays visible.
                    local_touched_targets.contains(&e.target)
                }
                _ => true,
            }
        })
        .collect()
}

/// Identity scoring works on events; for encounter-level filtering we
/// regenerate a minimal synthetic event stream from the roll-ups so the
/// one classifier serves both paths.
fn classify_names_from_encounters(encs: &[Encounter]) -> HashMap<String, IdentityScore> {
    let mut synth: Vec<Event> = Vec::with_capacity(encs.len() * 4);
    for enc in encs {
        for st in enc.by_actor.values() {
            if st.total <= 0 {
                continue;
            }
            // Three repeats satisfy the actor_damage>=3 signal.
            for _ in 0..3 {
                let mut ev = Event::new(enc.end);
                ev.kind = EventKind::MeleeDamage;
                ev.actor = st.actor.clone();
                ev.target = enc.target.clone();
                ev.amount_known = true;
                synth.push(ev);
            }
            if st.non_melee > 0 {
                let mut ev = Event::new(enc.end);
                ev.kind = EventKind::NonMeleeDamage;
                ev.actor = st.actor.clone();
                ev.target = enc.target.clone();
                ev.amount_known = true;
                synth.push(ev);
            }
        }
    }
    classify_names(&synth)
}
