use crate::publisher::{HubDamageEvent, HubPublisher, PublisherConfig, DEFAULT_HUB_URL};
use crate::watch;
use chrono::Duration as ChronoDuration;
use clap::Args;
use eqlog_core::{
    apply_identity_overrides, classify_names, player_name_from_log_path, DamageTotals, Encounter,
    EncounterSegmenter, Event, EventKind, IdentityClass, IdentityScore, LogParser, ParseContext,
    Reader, TimeFilter, DEFAULT_PC_THRESHOLD,
};
use hashbrown::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Path to an EverQuest combat log
    #[arg(long)]
    pub file: PathBuf,
    /// Tail the file and reprint tables as new lines arrive
    #[arg(long)]
    pub follow: bool,
    /// When following, start at `begin` or `end` (default: end when
    /// following, begin otherwise)
    #[arg(long)]
    pub start: Option<String>,
    /// Only ingest events from the last N hours (0 disables)
    #[arg(long, default_value_t = 0.0)]
    pub last_hours: f64,
}

#[derive(Args, Debug)]
pub struct EncountersArgs {
    /// Path to an EverQuest combat log
    #[arg(long)]
    pub file: PathBuf,
    /// Tail the file and print the latest encounter each second
    #[arg(long)]
    pub follow: bool,
    /// When following, start at `begin` or `end`
    #[arg(long)]
    pub start: Option<String>,
    /// Only ingest events from the last N hours (0 disables)
    #[arg(long, default_value_t = 0.0)]
    pub last_hours: f64,
    /// Idle gap that closes an encounter (e.g. 8s, 2m)
    #[arg(long, default_value = "8s")]
    pub idle_timeout: String,
    /// Keep encounters whose target looks like a player character
    #[arg(long)]
    pub include_pc_targets: bool,
    /// Score threshold for LikelyPC classification
    #[arg(long, default_value_t = DEFAULT_PC_THRESHOLD)]
    pub pc_threshold: i32,
    /// Print the identity classification table
    #[arg(long)]
    pub debug_identities: bool,
    /// Force a name to be treated as a PC (repeatable)
    #[arg(long = "force-pc")]
    pub force_pc: Vec<String>,
    /// Force a name to be treated as an NPC (repeatable)
    #[arg(long = "force-npc")]
    pub force_npc: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Path to an EverQuest combat log
    #[arg(long)]
    pub file: PathBuf,
    /// Room to publish into
    #[arg(long)]
    pub room: String,
    /// Room shared secret
    #[arg(long)]
    pub token: String,
    /// Hub base URL
    #[arg(long, default_value = DEFAULT_HUB_URL)]
    pub hub_url: String,
    /// Publisher id (default: random)
    #[arg(long)]
    pub publisher_id: Option<String>,
    /// Start at `begin` or `end` of the file (default end)
    #[arg(long)]
    pub start: Option<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Room to subscribe to
    #[arg(long)]
    pub room: String,
    /// Room shared secret
    #[arg(long)]
    pub token: String,
    /// Hub base URL
    #[arg(long, default_value = DEFAULT_HUB_URL)]
    pub hub_url: String,
}

pub async fn run_parse(args: ParseArgs) -> Result<(), String> {
    let start_end = start_at_end(args.follow, args.start.as_deref())?;
    let now = chrono::Local::now().fixed_offset();
    let tf = TimeFilter::last_hours(args.last_hours, now);
    let player = player_name_from_log_path(&args.file).unwrap_or_default();
    let parser = LogParser::local();
    let mut ctx = ParseContext::with_local(&player);
    let mut totals = DamageTotals::new();

    if !args.follow {
        for ev in load_events(&args.file, &parser, &mut ctx, &tf, &player)? {
            totals.process(&ev);
        }
        print_actor_table(&totals);
        println!();
        print_top_targets(&totals, 10);
        return Ok(());
    }

    let mut dirty = false;
    if args.last_hours > 0.0 && start_end {
        for ev in load_events(&args.file, &parser, &mut ctx, &tf, &player)? {
            totals.process(&ev);
        }
        dirty = true;
    }

    let (tx, mut rx) = mpsc::channel(1024);
    let mut tail_task = tokio::spawn(Reader::new(&args.file).tail(start_end, tx));
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            res = &mut tail_task => return tail_result(res),
            line = rx.recv() => {
                let Some(line) = line else { return Ok(()) };
                if let Some(mut ev) = parser.parse_line(&mut ctx, &line) {
                    if tf.allow(ev.timestamp) {
                        rewrite_you(&mut ev, &player);
                        totals.process(&ev);
                        dirty = true;
                    }
                }
            }
            _ = tick.tick() => {
                if dirty {
                    print_actor_table(&totals);
                    println!();
                    print_top_targets(&totals, 10);
                    println!();
                    dirty = false;
                }
            }
        }
    }
}

pub async fn run_encounters(args: EncountersArgs) -> Result<(), String> {
    let start_end = start_at_end(args.follow, args.start.as_deref())?;
    let idle_timeout = parse_duration(&args.idle_timeout)?;
    let now = chrono::Local::now().fixed_offset();
    let tf = TimeFilter::last_hours(args.last_hours, now);
    let player = player_name_from_log_path(&args.file).unwrap_or_default();
    let parser = LogParser::local();
    let mut ctx = ParseContext::with_local(&player);
    let force_pc: HashSet<String> = args.force_pc.iter().cloned().collect();
    let force_npc: HashSet<String> = args.force_npc.iter().cloned().collect();

    if !args.follow {
        let events = load_events(&args.file, &parser, &mut ctx, &tf, &player)?;
        let scores = classify_with_overrides(&events, args.pc_threshold, &force_pc, &force_npc);
        if args.debug_identities {
            print_identity_table(&events, &scores);
        }

        let mut seg = EncounterSegmenter::new(idle_timeout, player.clone());
        if !args.include_pc_targets {
            let excluded: HashSet<String> = scores
                .iter()
                .filter(|(_, sc)| sc.class == IdentityClass::LikelyPC)
                .map(|(name, _)| name.clone())
                .collect();
            seg.set_excluded_targets(excluded);
        }
        for ev in &events {
            seg.process(ev);
        }
        print_encounters(&seg.finalize());
        return Ok(());
    }

    let mut seg = EncounterSegmenter::new(idle_timeout, player.clone());
    let mut identity_events: Vec<Event> = Vec::with_capacity(4096);
    let mut dirty = false;

    if args.last_hours > 0.0 && start_end {
        for ev in load_events(&args.file, &parser, &mut ctx, &tf, &player)? {
            seg.process(&ev);
            push_identity_event(&mut identity_events, ev);
        }
        dirty = true;
    }

    let (tx, mut rx) = mpsc::channel(1024);
    let mut tail_task = tokio::spawn(Reader::new(&args.file).tail(start_end, tx));
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            res = &mut tail_task => return tail_result(res),
            line = rx.recv() => {
                let Some(line) = line else { return Ok(()) };
                if let Some(mut ev) = parser.parse_line(&mut ctx, &line) {
                    if tf.allow(ev.timestamp) {
                        rewrite_you(&mut ev, &player);
                        seg.process(&ev);
                        push_identity_event(&mut identity_events, ev);
                        dirty = true;
                    }
                }
            }
            _ = tick.tick() => {
                if !dirty {
                    continue;
                }
                let scores =
                    classify_with_overrides(&identity_events, args.pc_threshold, &force_pc, &force_npc);
                if args.debug_identities {
                    print_identity_table(&identity_events, &scores);
                }
                let mut encs = seg.snapshot();
                if !args.include_pc_targets {
                    encs.retain(|e| {
                        scores
                            .get(&e.target)
                            .map_or(true, |sc| sc.class != IdentityClass::LikelyPC)
                    });
                }
                if let Some(latest) = encs.last() {
                    print_encounters(std::slice::from_ref(latest));
                    println!();
                }
                dirty = false;
            }
        }
    }
}

pub async fn run_publish(args: PublishArgs) -> Result<(), String> {
    let start_end = start_at_end(true, args.start.as_deref())?;
    let player = player_name_from_log_path(&args.file).unwrap_or_default();
    let publisher = HubPublisher::new(PublisherConfig {
        hub_url: args.hub_url,
        room_id: args.room,
        room_token: args.token,
        publisher_id: args.publisher_id.unwrap_or_default(),
    })?;
    let flusher = tokio::spawn(publisher.clone().run());

    let parser = LogParser::local();
    let mut ctx = ParseContext::with_local(&player);
    let (tx, mut rx) = mpsc::channel(1024);
    let mut tail_task = tokio::spawn(Reader::new(&args.file).tail(start_end, tx));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            res = &mut tail_task => break tail_result(res),
            line = rx.recv() => {
                let Some(line) = line else { break Ok(()) };
                let Some(mut ev) = parser.parse_line(&mut ctx, &line) else { continue };
                if !ev.amount_known {
                    continue;
                }
                let kind = match ev.kind {
                    EventKind::MeleeDamage => "melee",
                    EventKind::NonMeleeDamage => "nonmelee",
                    _ => continue,
                };
                rewrite_you(&mut ev, &player);
                publisher.enqueue(HubDamageEvent {
                    ts_unix_ms: ev.timestamp.timestamp_millis(),
                    actor: ev.actor,
                    target: ev.target,
                    kind: kind.to_string(),
                    verb: ev.verb,
                    amount: ev.amount,
                    crit: ev.crit,
                });
            }
        }
    };

    flusher.abort();
    let st = publisher.status();
    info!(
        sent = st.sent_events,
        dropped_non_pc = st.dropped_non_pc_actor_events,
        "publisher stopped"
    );
    result
}

pub async fn run_watch(args: WatchArgs) -> Result<(), String> {
    watch::run(watch::WatchConfig {
        hub_url: args.hub_url,
        room_id: args.room,
        token: args.token,
    })
    .await
}

fn tail_result(
    res: Result<Result<(), eqlog_core::ReaderError>, tokio::task::JoinError>,
) -> Result<(), String> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("tail error: {e}")),
        Err(e) => Err(format!("tail task failed: {e}")),
    }
}

fn rewrite_you(ev: &mut Event, player: &str) {
    if player.is_empty() {
        return;
    }
    if ev.actor == "YOU" {
        ev.actor = player.to_string();
    }
    if ev.target == "YOU" {
        ev.target = player.to_string();
    }
}

fn load_events(
    path: &Path,
    parser: &LogParser,
    ctx: &mut ParseContext,
    tf: &TimeFilter,
    player: &str,
) -> Result<Vec<Event>, String> {
    let lines = Reader::new(path)
        .read_to_lines()
        .map_err(|e| e.to_string())?;
    let mut events = Vec::with_capacity(1024);
    for line in lines {
        if let Some(mut ev) = parser.parse_line(ctx, &line) {
            if !tf.allow(ev.timestamp) {
                continue;
            }
            rewrite_you(&mut ev, player);
            events.push(ev);
        }
    }
    Ok(events)
}

fn classify_with_overrides(
    events: &[Event],
    pc_threshold: i32,
    force_pc: &HashSet<String>,
    force_npc: &HashSet<String>,
) -> HashMap<String, IdentityScore> {
    let mut scores = classify_names(events);
    for name in force_pc.iter().chain(force_npc.iter()) {
        scores
            .entry(name.clone())
            .or_insert_with(|| IdentityScore::named(name.clone()));
    }
    apply_identity_overrides(&mut scores, pc_threshold, force_pc, force_npc);
    scores
}

fn push_identity_event(window: &mut Vec<Event>, ev: Event) {
    window.push(ev);
    if window.len() > 8192 {
        let n = window.len();
        window.drain(..n - 4096);
    }
}

fn start_at_end(follow: bool, start: Option<&str>) -> Result<bool, String> {
    match start {
        None => Ok(follow),
        Some(s) => match s.to_lowercase().as_str() {
            "begin" | "beginning" | "start" => Ok(false),
            "end" => Ok(true),
            other => Err(format!("invalid --start value {other:?} (expected begin|end)")),
        },
    }
}

/// Accepts `90`, `90s`, `250ms`, `2m`, `1.5h`.
fn parse_duration(s: &str) -> Result<ChronoDuration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let ms = match unit.trim() {
        "" | "s" | "sec" => value * 1000.0,
        "ms" => value,
        "m" | "min" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => return Err(format!("invalid duration unit {other:?}")),
    };
    Ok(ChronoDuration::milliseconds(ms as i64))
}

fn print_actor_table(totals: &DamageTotals) {
    println!(
        "{:<24} {:>10} {:>10} {:>10} {:>8} {:>10}",
        "Actor", "Melee", "NonMelee", "Total", "Sec", "DPS"
    );
    for st in totals.actors_sorted_by_total() {
        println!(
            "{:<24} {:>10} {:>10} {:>10} {:>8} {:>10.1}",
            st.actor,
            st.melee,
            st.non_melee,
            st.total,
            st.duration_seconds(),
            st.dps()
        );
    }
}

fn print_top_targets(totals: &DamageTotals, n: usize) {
    println!("Top Targets By Total Damage");
    println!("{:<28} {:>12}", "Target", "Total");
    for ts in totals.top_targets(n) {
        println!("{:<28} {:>12}", ts.target, ts.total);
    }
}

fn print_encounters(encs: &[Encounter]) {
    println!(
        "{:<24} {:<25} {:<25} {:>6} {:>12} {:>10}",
        "Target", "Start", "End", "Sec", "Total", "DPS(enc)"
    );
    for enc in encs {
        println!(
            "{:<24} {:<25} {:<25} {:>6} {:>12} {:>10.1}",
            enc.target,
            enc.start.to_rfc3339(),
            enc.end.to_rfc3339(),
            enc.duration_seconds(),
            enc.total,
            enc.dps()
        );
    }

    for enc in encs {
        println!();
        println!("Encounter: {}", enc.target);
        println!(
            "{:<24} {:>10} {:>10} {:>10} {:>9} {:>9} {:>6}",
            "Actor", "Melee", "NonMelee", "Total", "DPS(enc)", "SDPS", "Sec"
        );
        let enc_sec = enc.duration_seconds();
        for st in enc.actors_sorted_by_total().into_iter().take(8) {
            let dps_enc = if enc_sec > 0 {
                st.total as f64 / enc_sec as f64
            } else {
                0.0
            };
            let active_sec = st.active_seconds();
            let sdps = if active_sec > 0 {
                st.total as f64 / active_sec as f64
            } else {
                0.0
            };
            println!(
                "{:<24} {:>10} {:>10} {:>10} {:>9.1} {:>9.1} {:>6}",
                st.actor, st.melee, st.non_melee, st.total, dps_enc, sdps, active_sec
            );
        }
    }
}

fn print_identity_table(
    events: &[Event],
    scores: &HashMap<String, IdentityScore>,
) {
    let mut seen: HashSet<&str> = HashSet::new();
    for ev in events {
        if matches!(ev.kind, EventKind::MeleeDamage | EventKind::NonMeleeDamage)
            && ev.amount_known
        {
            if !ev.actor.is_empty() {
                seen.insert(ev.actor.as_str());
            }
            if !ev.target.is_empty() {
                seen.insert(ev.target.as_str());
            }
        }
    }
    let mut rows: Vec<&IdentityScore> =
        seen.iter().filter_map(|name| scores.get(*name)).collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{:<24} {:>6} {:<10} Reasons", "Name", "Score", "Class");
    for sc in rows {
        println!(
            "{:<24} {:>6} {:<10} {}",
            sc.name,
            sc.score,
            sc.class.as_str(),
            sc.reasons.join(",")
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("8s").unwrap(), ChronoDuration::seconds(8));
        assert_eq!(parse_duration("90").unwrap(), ChronoDuration::seconds(90));
        assert_eq!(
            parse_duration("250ms").unwrap(),
            ChronoDuration::milliseconds(250)
        );
        assert_eq!(parse_duration("2m").unwrap(), ChronoDuration::minutes(2));
        assert_eq!(
            parse_duration("1.5h").unwrap(),
            ChronoDuration::minutes(90)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("8x").is_err());
    }

    #[test]
    fn test_start_at_end() {
        assert!(!start_at_end(false, None).unwrap());
        assert!(start_at_end(true, None).unwrap());
        assert!(!start_at_end(true, Some("begin")).unwrap());
        assert!(start_at_end(false, Some("END")).unwrap());
        assert!(start_at_end(true, Some("middle")).is_err());
    }

    #[test]
    fn test_load_events_rewrites_you_and_filters() {
        let dir = std::env::temp_dir();
        let path = dir.join("eqlog_Emberval_Test.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[Fri Jan 23 07:46:01 2026] You slash a rat for 10 points of damage."
        )
        .unwrap();
        writeln!(f, "not a log line").unwrap();
        drop(f);

        let parser = LogParser::local();
        let mut ctx = ParseContext::with_local("Emberval");
        let tf = TimeFilter::default();
        let events = load_events(&path, &parser, &mut ctx, &tf, "Emberval").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "Emberval");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_classify_with_overrides_inserts_forced_names() {
        let force_pc: HashSet<String> = ["Mystery".to_string()].into_iter().collect();
        let scores = classify_with_overrides(&[], DEFAULT_PC_THRESHOLD, &force_pc, &HashSet::new());
        assert_eq!(scores["Mystery"].class, IdentityClass::LikelyPC);
    }
}
