use super::*;
use chrono::{FixedOffset, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use std::io::BufRead;
use std::sync::LazyLock;


const TS_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

static RE_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(?P<ts>[^\]]+)\]\s+(?P<msg>.*)$").expect("timestamp regex"));

static RE_CRIT_META_ACTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<actor>.+?)\s+scores\s+a\s+critical\s+hit!\s*\((?P<val>\d+)\)$")
        .expect("crit meta regex")
});
static RE_CRIT_META_YOU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+deliver\s+a\s+critical\s+blast!\s*\((?P<val>\d+)\)$")
        .expect("crit blast regex")
});

static RE_CAST_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^You\s+begin\s+casting\s+(?P<spell>.+?)\.$").expect("cast regex"));
static RE_AFFLICTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<target>.+?)\s+is\s+afflicted\s+by\s+(?P<spell>.+?)\.$")
        .expect("affliction regex")
});
static RE_THORNS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<target>.+?)\s+was\s+pierced\s+by\s+thorns\.$").expect("thorns regex")
});

static RE_HEAL_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<target>.+?)\s+has\s+been\s+healed\s+for\s+(?P<amt>\d+)\s+points\.$")
        .expect("heal regex")
});
// Some servers emit "healed for N points of damage."; still a heal.
static RE_HEAL_TARGET_DAMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<target>.+?)\s+has\s+been\s+healed\s+for\s+(?P<amt>\d+)\s+points\s+of\s+damage\.$",
    )
    .expect("heal damage regex")
});
static RE_HEAL_YOU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+have\s+been\s+healed\s+for\s+(?P<amt>\d+)\s+points\.$").expect("heal regex")
});
static RE_HEAL_YOU_DAMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+have\s+been\s+healed\s+for\s+(?P<amt>\d+)\s+points\s+of\s+damage\.$")
        .expect("heal damage regex")
});

static RE_INCOMING_BY_NON_MELEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+have\s+taken\s+(?P<amt>\d+)\s+points\s+of\s+damage\s+by\s+non-melee\.$")
        .expect("incoming regex")
});
static RE_INCOMING_NON_MELEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+have\s+taken\s+(?P<amt>\d+)\s+points\s+of\s+non-melee\s+damage\.$")
        .expect("incoming regex")
});
static RE_INCOMING_ON_MELEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<actor>.+?)\s+(?P<verb>hits|hit|bashes|bash|kicks|kick|crushes|crush|slashes|slash|pierces|pierce|punches|punch|strikes|strike)\s+on\s+(?P<target>YOU|[A-Z][a-zA-Z'\-]{2,15})\s+for\s+(?P<amt>\d+)\s+points\s+of\s+damage\.$",
    )
    .expect("incoming melee regex")
});

static RE_NON_MELEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<actor>.+?)\s+hit\s+(?P<target>.+?)\s+for\s+(?P<amt>\d+)\s+points\s+of\s+non-melee\s+damage\.$",
    )
    .expect("non-melee regex")
});

static RE_YOU_MELEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+(?P<verb>\w+)\s+(?P<target>.+?)\s+for\s+(?P<amt>\d+)\s+points\s+of\s+damage\.$")
        .expect("you melee regex")
});
static RE_OTHER_MELEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<actor>.+?)\s+(?P<verb>hits|hit|kicks|kick|bashes|bash|crushes|crush|slashes|slash|pierces|pierce|punches|punch|claws|claw|bites|bite|mauls|maul|strikes|strike|backstabs|backstab|frenzies|frenzy|rends|rend)\s+(?P<target>.+?)\s+for\s+(?P<amt>\d+)\s+points\s+of\s+damage\.$",
    )
    .expect("other melee regex")
});

static RE_YOU_MISS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You\s+try\s+to\s+(?P<verb>\w+)\s+(?P<target>.+?),\s+but\s+miss!$")
        .expect("you miss regex")
});
static RE_TRY_HIT_AVOID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<actor>.+?)\s+tries\s+to\s+hit\s+(?P<target>.+?),\s+but\s+(?P<defender>.+?)\s+(?P<avoid>dodges|blocks|parries|ripostes|misses)!$",
    )
    .expect("avoid regex")
});
static RE_TRY_VERB_MISS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<actor>.+?)\s+tries\s+to\s+(?P<verb>kick|bash|strike|slash|pierce|crush|hit)\s+(?P<target>.+?),\s+but\s+misses!$",
    )
    .expect("try miss regex")
});

static RE_AUTO_ATTACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Auto\s+attack\s+is\s+(on|off)\.$").expect("auto attack regex"));

/// Context-sensitive line-to-event converter. Holds only the timezone the
/// bracketed timestamps are interpreted in; all per-stream state lives in
/// the caller's [`ParseContext`].
pub struct LogParser {
    offset: FixedOffset,
}

impl LogParser {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Parser using the machine's local UTC offset.
    pub fn local() -> Self {
        Self {
            offset: *Local::now().offset(),
        }
    }

    /// Convert one log line into an [`Event`]. Returns `None` for blank
    /// lines, lines without a leading `[timestamp]`, and unparseable
    /// timestamps. A timestamped line no pattern recognizes is still
    /// accepted with `EventKind::Unknown` so downstream windows see it.
    pub fn parse_line(&self, ctx: &mut ParseContext, line: &str) -> Option<Event> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return None;
        }

        let caps = RE_TIMESTAMP.captures(line)?;
        let ts = self.parse_timestamp(caps.name("ts")?.as_str())?;
        let msg = caps.name("msg")?.as_str();

        if matches!(&ctx.pending_crit, Some(pc) if pc.ttl <= 0) {
            ctx.pending_crit = None;
        }

        let mut ev = Event::new(ts);
        ev.raw = line.to_string();

        if let Some(m) = RE_CRIT_META_ACTOR.captures(msg) {
            if let Some(val) = parse_amount(&m["val"]) {
                ev.kind = EventKind::CritMeta;
                ev.actor = rewrite_local(ctx, &m["actor"]);
                ev.meta_int = val;
                ctx.pending_crit = Some(PendingCrit {
                    actor: ev.actor.clone(),
                    ts,
                    value: val,
                    ttl: 2,
                });
                return Some(ev);
            }
        }
        if let Some(m) = RE_CRIT_META_YOU.captures(msg) {
            if let Some(val) = parse_amount(&m["val"]) {
                ev.kind = EventKind::CritMeta;
                ev.actor = "YOU".to_string();
                ev.meta_int = val;
                ctx.pending_crit = Some(PendingCrit {
                    actor: "YOU".to_string(),
                    ts,
                    value: val,
                    ttl: 2,
                });
                return Some(ev);
            }
        }

        if let Some(m) = RE_CAST_START.captures(msg) {
            ev.kind = EventKind::CastStart;
            ev.actor = "YOU".to_string();
            ev.spell_or_skill = m["spell"].to_string();
            return Some(ev);
        }
        if let Some(m) = RE_AFFLICTION.captures(msg) {
            ev.kind = EventKind::Affliction;
            ev.target = m["target"].to_string();
            ev.spell_or_skill = m["spell"].to_string();
            return Some(ev);
        }
        if let Some(m) = RE_THORNS_MARKER.captures(msg) {
            ev.kind = EventKind::ThornsMarker;
            ev.target = m["target"].to_string();
            ev.amount_known = false;
            return Some(ev);
        }

        for (re, target_you) in [
            (&*RE_HEAL_TARGET, false),
            (&*RE_HEAL_TARGET_DAMAGE, false),
            (&*RE_HEAL_YOU, true),
            (&*RE_HEAL_YOU_DAMAGE, true),
        ] {
            if let Some(m) = re.captures(msg) {
                if let Some(amt) = parse_amount(&m["amt"]) {
                    ev.kind = EventKind::Heal;
                    ev.target = if target_you {
                        "YOU".to_string()
                    } else {
                        m["target"].to_string()
                    };
                    ev.amount = amt;
                    ev.amount_known = true;
                    return Some(ev);
                }
            }
        }

        for re in [&*RE_INCOMING_BY_NON_MELEE, &*RE_INCOMING_NON_MELEE] {
            if let Some(m) = re.captures(msg) {
                if let Some(amt) = parse_amount(&m["amt"]) {
                    ev.kind = EventKind::IncomingDamage;
                    ev.target = "YOU".to_string();
                    ev.amount = amt;
                    ev.amount_known = true;
                    ev.verb = "non-melee".to_string();
                    return Some(ev);
                }
            }
        }
        if let Some(m) = RE_INCOMING_ON_MELEE.captures(msg) {
            if let Some(amt) = parse_amount(&m["amt"]) {
                ev.kind = EventKind::IncomingDamage;
                ev.actor = rewrite_local(ctx, &m["actor"]);
                ev.target = m["target"].to_string();
                ev.verb = m["verb"].to_string();
                ev.amount = amt;
                ev.amount_known = true;
                return Some(ev);
            }
        }

        if let Some(m) = RE_NON_MELEE.captures(msg) {
            if let Some(amt) = parse_amount(&m["amt"]) {
                ev.kind = EventKind::NonMeleeDamage;
                ev.actor = rewrite_local(ctx, &m["actor"]);
                ev.target = m["target"].to_string();
                ev.amount = amt;
                ev.amount_known = true;
                ev.damage_class = DamageClass::Direct;
                handle_pending_crit(ctx, &mut ev);
                return Some(ev);
            }
        }
        if let Some(m) = RE_YOU_MELEE.captures(msg) {
            if let Some(amt) = parse_amount(&m["amt"]) {
                ev.kind = EventKind::MeleeDamage;
                ev.actor = "YOU".to_string();
                ev.verb = m["verb"].to_string();
                ev.target = m["target"].to_string();
                ev.amount = amt;
                ev.amount_known = true;
                apply_damage_class(&mut ev);
                handle_pending_crit(ctx, &mut ev);
                return Some(ev);
            }
        }
        if let Some(m) = RE_OTHER_MELEE.captures(msg) {
            if let Some(amt) = parse_amount(&m["amt"]) {
                ev.kind = EventKind::MeleeDamage;
                ev.actor = rewrite_local(ctx, &m["actor"]);
                ev.verb = m["verb"].to_string();
                ev.target = m["target"].to_string();
                ev.amount = amt;
                ev.amount_known = true;
                apply_damage_class(&mut ev);
                handle_pending_crit(ctx, &mut ev);
                return Some(ev);
            }
        }

        if let Some(m) = RE_YOU_MISS.captures(msg) {
            ev.kind = EventKind::Miss;
            ev.actor = "YOU".to_string();
            ev.verb = m["verb"].to_string();
            ev.target = m["target"].to_string();
            handle_pending_crit(ctx, &mut ev);
            return Some(ev);
        }
        if let Some(m) = RE_TRY_HIT_AVOID.captures(msg) {
            let avoid = &m["avoid"];
            ev.kind = if avoid == "misses" {
                EventKind::Miss
            } else {
                EventKind::Avoid
            };
            ev.actor = rewrite_local(ctx, &m["actor"]);
            ev.target = m["target"].to_string();
            ev.verb = avoid.to_string();
            handle_pending_crit(ctx, &mut ev);
            return Some(ev);
        }
        if let Some(m) = RE_TRY_VERB_MISS.captures(msg) {
            ev.kind = EventKind::Miss;
            ev.actor = rewrite_local(ctx, &m["actor"]);
            ev.verb = m["verb"].to_string();
            ev.target = m["target"].to_string();
            handle_pending_crit(ctx, &mut ev);
            return Some(ev);
        }

        if let Some(m) = RE_AUTO_ATTACK.captures(msg) {
            ev.kind = EventKind::ZoneOrSystem;
            ev.spell_or_skill = "auto_attack".to_string();
            ev.verb = m.get(1).map(|g| g.as_str()).unwrap_or("").to_string();
            handle_pending_crit(ctx, &mut ev);
            return Some(ev);
        }

        Some(ev)
    }

    fn parse_timestamp(&self, segment: &str) -> Option<chrono::DateTime<FixedOffset>> {
        let naive = NaiveDateTime::parse_from_str(segment, TS_FORMAT).ok()?;
        self.offset.from_local_datetime(&naive).single()
    }

    /// Single-pass iterator over `reader`, yielding accepted events only.
    pub fn parse_file<'a, R: BufRead>(
        &'a self,
        reader: R,
        ctx: &'a mut ParseContext,
    ) -> EventIter<'a, R> {
        EventIter {
            reader,
            parser: self,
            ctx,
            line: String::new(),
        }
    }
}

fn rewrite_local(ctx: &ParseContext, actor: &str) -> String {
    if !ctx.local_actor_name.is_empty() && actor == ctx.local_actor_name {
        "YOU".to_string()
    } else {
        actor.to_string()
    }
}

fn apply_damage_class(ev: &mut Event) {
    if !ev.amount_known || ev.kind != EventKind::MeleeDamage {
        return;
    }
    ev.damage_class = match ev.verb.to_lowercase().as_str() {
        "pierce" | "pierces" => DamageClass::Pierce,
        "slash" | "slashes" => DamageClass::Slash,
        "crush" | "crushes" => DamageClass::Crush,
        "bash" | "bashes" => DamageClass::Bash,
        "kick" | "kicks" => DamageClass::Kick,
        _ => ev.damage_class,
    };
}

/// Consume a pending crit: the very next melee/non-melee damage line by
/// the same actor within one second inherits `crit` and the crit value.
fn handle_pending_crit(ctx: &mut ParseContext, ev: &mut Event) {
    let Some(pc) = ctx.pending_crit.as_mut() else {
        return;
    };
    if pc.ttl <= 0 {
        ctx.pending_crit = None;
        return;
    }
    let dt = ev.timestamp.signed_duration_since(pc.ts);
    if dt < chrono::Duration::zero() || dt > chrono::Duration::seconds(1) {
        ctx.pending_crit = None;
        return;
    }
    if ev.actor != pc.actor {
        return;
    }
    if ev.kind != EventKind::MeleeDamage && ev.kind != EventKind::NonMeleeDamage {
        return;
    }
    ev.crit = true;
    ev.meta_int = pc.value;
    pc.ttl -= 1;
    if pc.ttl <= 0 {
        ctx.pending_crit = None;
    }
}

fn parse_amount(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

/// Single-pass, non-restartable event iterator over a buffered reader.
/// Lines the parser rejects are skipped; I/O errors end the iteration
/// after being yielded once.
pub struct EventIter<'a, R: BufRead> {
    reader: R,
    parser: &'a LogParser,
    ctx: &'a mut ParseContext,
    line: String,
}

impl<R: BufRead> Iterator for EventIter<'_, R> {
    type Item = std::io::Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = self.line.trim_end_matches('\n');
                    if let Some(ev) = self.parser.parse_line(self.ctx, trimmed) {
                        return Some(Ok(ev));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
