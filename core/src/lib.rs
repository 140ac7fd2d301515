pub mod combat_log;
pub mod encounter;
pub mod filter;
pub mod identity;
pub mod query;
pub mod totals;

// Re-exports for convenience
pub use combat_log::{
    player_name_from_log_path, DamageClass, Event, EventIter, EventKind, LogParser, ParseContext,
    PendingCrit, Reader, ReaderError,
};
pub use encounter::{Encounter, EncounterActorStats, EncounterSegmenter};
pub use filter::TimeFilter;
pub use identity::{
    apply_identity_overrides, classify_names, IdentityClass, IdentityScore, DEFAULT_PC_THRESHOLD,
};
pub use query::{Snapshot, SnapshotOptions};
pub use totals::DamageTotals;
