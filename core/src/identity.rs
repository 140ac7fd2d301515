//! Heuristic player-character / NPC classification.
//!
//! EverQuest logs carry no entity markers, so names are scored from the
//! shape of the name itself plus how the name behaved in a window of
//! recent events.

use crate::combat_log::{Event, EventKind};
use hashbrown::{HashMap, HashSet};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityClass {
    #[default]
    Unknown,
    LikelyPC,
    LikelyNPC,
}

impl IdentityClass {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityClass::LikelyPC => "LikelyPC",
            IdentityClass::LikelyNPC => "LikelyNPC",
            IdentityClass::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityScore {
    pub name: String,
    pub score: i32,
    pub class: IdentityClass,
    pub reasons: Vec<&'static str>,
}

impl IdentityScore {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

pub const DEFAULT_PC_THRESHOLD: i32 = 6;

static RE_PC_MORPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-zA-Z'\-]{2,15}$").expect("pc morphology regex"));

#[derive(Default)]
struct IdentityAccum {
    seen_actor: bool,
    seen_target: bool,
    actor_amount_damage: u32,
    actor_non_melee: bool,
    actor_cast_start: bool,
}

/// Score every name observed in `events` and classify it.
pub fn classify_names(events: &[Event]) -> HashMap<String, IdentityScore> {
    let mut acc: HashMap<String, IdentityAccum> = HashMap::new();

    for ev in events {
        match ev.kind {
            EventKind::CastStart => {
                if !ev.actor.is_empty() {
                    let a = acc.entry(ev.actor.clone()).or_default();
                    a.seen_actor = true;
                    a.actor_cast_start = true;
                }
            }
            EventKind::MeleeDamage | EventKind::NonMeleeDamage => {
                if !ev.amount_known {
                    continue;
                }
                if !ev.actor.is_empty() {
                    let a = acc.entry(ev.actor.clone()).or_default();
                    a.seen_actor = true;
                    a.actor_amount_damage += 1;
                    if ev.kind == EventKind::NonMeleeDamage {
                        a.actor_non_melee = true;
                    }
                }
                if !ev.target.is_empty() {
                    acc.entry(ev.target.clone()).or_default().seen_target = true;
                }
            }
            _ => {}
        }
    }

    let mut out = HashMap::with_capacity(acc.len());
    for (name, a) in acc {
        let mut sc = IdentityScore::named(name.clone());

        if !name.contains(' ') {
            sc.score += 3;
            sc.reasons.push("single_token");
        }
        if name.as_bytes().first().is_some_and(|b| b.is_ascii_uppercase()) {
            sc.score += 2;
            sc.reasons.push("initial_cap");
        }
        if RE_PC_MORPH.is_match(&name) {
            sc.score += 1;
            sc.reasons.push("pc_regex");
        }

        if a.actor_amount_damage >= 3 {
            sc.score += 1;
            sc.reasons.push("actor_damage>=3");
        }
        if a.actor_non_melee {
            sc.score += 1;
            sc.reasons.push("actor_nonmelee");
        }
        if a.actor_cast_start {
            sc.score += 1;
            sc.reasons.push("actor_caststart");
        }

        let mut article = false;
        if name.starts_with("a ") || name.starts_with("an ") || name.starts_with("the ") {
            sc.score -= 4;
            article = true;
            sc.reasons.push("article_prefix");
        }
        if name.contains(' ') {
            sc.score -= 2;
            sc.reasons.push("has_spaces");
            if name.as_bytes().first().is_some_and(|b| b.is_ascii_lowercase()) {
                sc.score -= 3;
                sc.reasons.push("spaces_lowercase_start");
            }
        }
        if name.to_lowercase().contains("training dummy") {
            sc.score -= 2;
            sc.reasons.push("training_dummy");
        }
        if a.seen_target && !a.seen_actor {
            sc.score -= 2;
            sc.reasons.push("target_only");
        }

        sc.class = if sc.score >= DEFAULT_PC_THRESHOLD {
            IdentityClass::LikelyPC
        } else if article {
            IdentityClass::LikelyNPC
        } else {
            IdentityClass::Unknown
        };

        out.insert(name, sc);
    }

    out
}

/// Re-classify against `pc_threshold` and apply force-PC / force-NPC
/// sets. Force-NPC wins when a name is in both.
pub fn apply_identity_overrides(
    scores: &mut HashMap<String, IdentityScore>,
    pc_threshold: i32,
    force_pc: &HashSet<String>,
    force_npc: &HashSet<String>,
) {
    let pc_threshold = if pc_threshold <= 0 {
        DEFAULT_PC_THRESHOLD
    } else {
        pc_threshold
    };

    for (name, sc) in scores.iter_mut() {
        let article = sc.reasons.contains(&"article_prefix");

        sc.class = if sc.score >= pc_threshold {
            IdentityClass::LikelyPC
        } else if article {
            IdentityClass::LikelyNPC
        } else {
            IdentityClass::Unknown
        };

        if force_npc.contains(name) {
            sc.class = IdentityClass::LikelyNPC;
            sc.reasons.push("force-npc");
            continue;
        }
        if force_pc.contains(name) {
            sc.class = IdentityClass::LikelyPC;
            sc.reasons.push("force-pc");
        }
    }
}
