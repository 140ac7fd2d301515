use chrono::{DateTime, FixedOffset};

/// Closed set of line classifications produced by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    Unknown,
    MeleeDamage,
    NonMeleeDamage,
    Miss,
    Avoid,
    CritMeta,
    CastStart,
    Affliction,
    Heal,
    ThornsMarker,
    Death,
    ZoneOrSystem,
    IncomingDamage,
}

/// Damage classes derived from melee verbs, plus `Direct` for non-melee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DamageClass {
    #[default]
    Unknown,
    Pierce,
    Slash,
    Crush,
    Bash,
    Kick,
    Direct,
}

impl DamageClass {
    /// Fixed enumeration order used by breakdown views.
    pub const BREAKDOWN_ORDER: [DamageClass; 6] = [
        DamageClass::Pierce,
        DamageClass::Slash,
        DamageClass::Crush,
        DamageClass::Bash,
        DamageClass::Kick,
        DamageClass::Direct,
    ];

    /// Display label used verbatim in breakdown output.
    pub fn display_name(self) -> &'static str {
        match self {
            DamageClass::Pierce => "Pierces",
            DamageClass::Slash => "Slashes",
            DamageClass::Crush => "Crushes",
            DamageClass::Bash => "Bashes",
            DamageClass::Kick => "Kicks",
            DamageClass::Direct => "Direct Damage",
            DamageClass::Unknown => "Unknown",
        }
    }
}

/// One parsed log line. `amount` is only meaningful when `amount_known`.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<FixedOffset>,
    pub raw: String,
    pub kind: EventKind,
    pub damage_class: DamageClass,
    pub actor: String,
    pub target: String,
    pub spell_or_skill: String,
    pub verb: String,
    pub amount: i64,
    pub amount_known: bool,
    pub crit: bool,
    pub meta_int: i64,
}

impl Event {
    pub fn new(timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            timestamp,
            raw: String::new(),
            kind: EventKind::Unknown,
            damage_class: DamageClass::Unknown,
            actor: String::new(),
            target: String::new(),
            spell_or_skill: String::new(),
            verb: String::new(),
            amount: 0,
            amount_known: false,
            crit: false,
            meta_int: 0,
        }
    }
}

/// Crit metadata waiting for the damage line it annotates. The ttl starts
/// at 2 so one unrelated line between the crit line and the damage line
/// does not break the association.
#[derive(Debug, Clone)]
pub struct PendingCrit {
    pub actor: String,
    pub ts: DateTime<FixedOffset>,
    pub value: i64,
    pub ttl: i32,
}

/// Mutable per-log-stream parse state. Owned by exactly one parser loop;
/// never shared across sources.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    pub local_actor_name: String,
    pub pending_crit: Option<PendingCrit>,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(name: impl Into<String>) -> Self {
        Self {
            local_actor_name: name.into(),
            pending_crit: None,
        }
    }
}
