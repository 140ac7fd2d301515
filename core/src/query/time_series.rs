//! Rolling per-actor damage series over fixed-width time buckets.

use crate::combat_log::{Event, EventKind};
use crate::encounter::EncounterSegmenter;
use crate::identity::{apply_identity_overrides, classify_names, IdentityClass};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use hashbrown::{HashMap, HashSet};
use serde::Serialize;

const DEFAULT_BUCKET_SEC: i64 = 5;
const DEFAULT_MAX_BUCKETS: usize = 100;

/// Which actors each bucket row retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeriesMode {
    #[default]
    All,
    /// Only the local player's row.
    Me,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerBucket {
    pub bucket_start: String,
    pub bucket_sec: i64,
    pub damage_by_actor: HashMap<String, i64>,
    pub total_damage: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayersSeries {
    pub now: String,
    pub bucket_sec: i64,
    pub max_buckets: usize,
    pub actors: Vec<String>,
    pub buckets: Vec<PlayerBucket>,
}

struct PlayersBucketAgg {
    bucket_sec: i64,
    max_buckets: usize,
    buckets: HashMap<i64, HashMap<String, i64>>,
    totals: HashMap<i64, i64>,
    order: Vec<i64>,
}

impl PlayersBucketAgg {
    fn new(bucket_sec: i64, max_buckets: usize) -> Self {
        Self {
            bucket_sec: if bucket_sec <= 0 {
                DEFAULT_BUCKET_SEC
            } else {
                bucket_sec
            },
            max_buckets: if max_buckets == 0 {
                DEFAULT_MAX_BUCKETS
            } else {
                max_buckets
            },
            buckets: HashMap::new(),
            totals: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn add(&mut self, ts: DateTime<FixedOffset>, actor: &str, amount: i64) {
        if amount <= 0 {
            return;
        }
        let unix = ts.timestamp();
        let bucket_start = unix - unix.rem_euclid(self.bucket_sec);
        if !self.buckets.contains_key(&bucket_start) {
            self.buckets.insert(bucket_start, HashMap::new());
            self.order.push(bucket_start);
        }
        *self
            .buckets
            .get_mut(&bucket_start)
            .expect("bucket")
            .entry(actor.to_string())
            .or_insert(0) += amount;
        *self.totals.entry(bucket_start).or_insert(0) += amount;
        if self.order.len() > self.max_buckets {
            self.evict();
        }
    }

    fn evict(&mut self) {
        if self.order.len() <= self.max_buckets {
            return;
        }
        let max = *self.order.iter().max().expect("non-empty order");
        let cut = max - (self.max_buckets as i64 - 1) * self.bucket_sec;
        let (kept, dropped): (Vec<i64>, Vec<i64>) =
            self.order.iter().copied().partition(|bs| *bs >= cut);
        for bs in dropped {
            self.buckets.remove(&bs);
            self.totals.remove(&bs);
        }
        self.order = kept;
    }

    fn build_series(
        &self,
        now: DateTime<FixedOffset>,
        actor_order: &[String],
        mode: SeriesMode,
        local: &str,
    ) -> PlayersSeries {
        let mut starts: Vec<i64> = Vec::with_capacity(self.order.len());
        let mut seen = HashSet::with_capacity(self.order.len());
        for bs in &self.order {
            if seen.insert(*bs) {
                starts.push(*bs);
            }
        }
        starts.sort_by(|a, b| b.cmp(a));

        let mut buckets = Vec::with_capacity(starts.len());
        for bs in starts {
            let total = self.totals.get(&bs).copied().unwrap_or(0);
            if total <= 0 {
                continue;
            }
            let mut row = PlayerBucket {
                bucket_start: Utc
                    .timestamp_opt(bs, 0)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                bucket_sec: self.bucket_sec,
                damage_by_actor: HashMap::new(),
                total_damage: total,
            };
            for actor in actor_order {
                if mode == SeriesMode::Me && !local.is_empty() && actor.as_str() != local {
                    continue;
                }
                if let Some(v) = self.buckets.get(&bs).and_then(|m| m.get(actor)) {
                    if *v != 0 {
                        row.damage_by_actor.insert(actor.clone(), *v);
                    }
                }
            }
            buckets.push(row);
        }

        let actors = if mode == SeriesMode::Me && !local.is_empty() {
            vec![local.to_string()]
        } else {
            actor_order.to_vec()
        };

        PlayersSeries {
            now: now.to_rfc3339(),
            bucket_sec: self.bucket_sec,
            max_buckets: self.max_buckets,
            actors,
            buckets,
        }
    }
}

impl EncounterSegmenter {
    /// Feed the bounded identity window and mark the cached scores stale.
    pub(crate) fn observe_identity_event(&mut self, ev: Event) {
        self.identity_events.push(ev);
        if self.identity_events.len() > 8192 {
            let n = self.identity_events.len();
            self.identity_events.drain(..n - 4096);
        }
        self.identity_dirty = true;
    }

    pub(crate) fn refresh_identity_if_needed(&mut self, force: bool) {
        if !self.identity_dirty && !force {
            return;
        }
        if self.identity_events.is_empty() {
            return;
        }
        let mut scores = classify_names(&self.identity_events);
        apply_identity_overrides(
            &mut scores,
            crate::identity::DEFAULT_PC_THRESHOLD,
            &HashSet::new(),
            &HashSet::new(),
        );
        self.identity_scores = scores;
        self.identity_dirty = false;
    }

    /// Rolling per-actor damage series covering the recent-damage window,
    /// restricted to actors the identity window classifies LikelyPC.
    /// Newest bucket first; the local player sorts first among actors.
    pub fn build_players_series(
        &mut self,
        now: DateTime<FixedOffset>,
        bucket_sec: i64,
        max_buckets: usize,
        mode: SeriesMode,
    ) -> PlayersSeries {
        self.refresh_identity_if_needed(false);

        let mut agg = PlayersBucketAgg::new(bucket_sec, max_buckets);
        for ev in &self.recent_damage_events {
            if !matches!(ev.kind, EventKind::MeleeDamage | EventKind::NonMeleeDamage) {
                continue;
            }
            if !ev.amount_known {
                continue;
            }
            let likely_pc = self
                .identity_scores
                .get(&ev.actor)
                .is_some_and(|sc| sc.class == IdentityClass::LikelyPC);
            if !likely_pc {
                continue;
            }
            agg.add(ev.timestamp, &ev.actor, ev.amount);
        }
        agg.evict();

        let mut totals: HashMap<&str, i64> = HashMap::new();
        for bs in &agg.order {
            if let Some(m) = agg.buckets.get(bs) {
                for (actor, v) in m {
                    *totals.entry(actor.as_str()).or_insert(0) += v;
                }
            }
        }

        let local = self.player_name.clone();
        let mut actors: Vec<String> = totals.keys().map(|a| a.to_string()).collect();
        actors.sort_by(|a, b| {
            if !local.is_empty() {
                if a == &local && b != &local {
                    return std::cmp::Ordering::Less;
                }
                if b == &local && a != &local {
                    return std::cmp::Ordering::Greater;
                }
            }
            let ta = totals.get(a.as_str()).copied().unwrap_or(0);
            let tb = totals.get(b.as_str()).copied().unwrap_or(0);
            tb.cmp(&ta).then_with(|| a.cmp(b))
        });

        agg.build_series(now, &actors, mode, &local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn ts(secs: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(secs, 0)
            .unwrap()
    }

    fn melee(secs: i64, actor: &str, target: &str, amount: i64) -> Event {
        let mut ev = Event::new(ts(secs));
        ev.kind = EventKind::MeleeDamage;
        ev.actor = actor.to_string();
        ev.target = target.to_string();
        ev.amount = amount;
        ev.amount_known = true;
        ev
    }

    fn feed_pc(s: &mut EncounterSegmenter, secs: i64, actor: &str, amount: i64) {
        s.process(&melee(secs, actor, "a rat", amount));
    }

    #[test]
    fn test_series_buckets_and_totals() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        // Same 5s window: one bucket.
        feed_pc(&mut s, 100, "Sigdis", 10);
        feed_pc(&mut s, 103, "Sigdis", 20);
        // Next window.
        feed_pc(&mut s, 106, "Sigdis", 5);

        let series = s.build_players_series(ts(200), 5, 50, SeriesMode::All);
        assert_eq!(series.bucket_sec, 5);
        assert_eq!(series.buckets.len(), 2);
        // Newest first.
        assert_eq!(series.buckets[0].total_damage, 5);
        assert_eq!(series.buckets[1].total_damage, 30);
        assert_eq!(series.buckets[1].damage_by_actor["Sigdis"], 30);
    }

    #[test]
    fn test_series_filters_npc_actors() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        feed_pc(&mut s, 100, "Sigdis", 10);
        // NPC shape: article prefix, spaces.
        s.process(&melee(100, "a gnoll pup", "Sigdis", 99));

        let series = s.build_players_series(ts(200), 5, 50, SeriesMode::All);
        assert_eq!(series.actors, vec!["Sigdis".to_string()]);
        assert_eq!(series.buckets.len(), 1);
        assert_eq!(series.buckets[0].total_damage, 10);
        assert!(!series.buckets[0].damage_by_actor.contains_key("a gnoll pup"));
    }

    #[test]
    fn test_series_local_player_sorts_first() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "Emberval");
        feed_pc(&mut s, 100, "Sigdis", 500);
        feed_pc(&mut s, 100, "Emberval", 10);

        let series = s.build_players_series(ts(200), 5, 50, SeriesMode::All);
        assert_eq!(series.actors[0], "Emberval");
        assert_eq!(series.actors[1], "Sigdis");
    }

    #[test]
    fn test_series_me_mode_keeps_only_local() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "Emberval");
        feed_pc(&mut s, 100, "Sigdis", 500);
        feed_pc(&mut s, 100, "Emberval", 10);

        let series = s.build_players_series(ts(200), 5, 50, SeriesMode::Me);
        assert_eq!(series.actors, vec!["Emberval".to_string()]);
        for b in &series.buckets {
            assert!(!b.damage_by_actor.contains_key("Sigdis"));
        }
    }

    #[test]
    fn test_series_eviction_keeps_recent_window() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        // 6 buckets of width 5 with max_buckets=4: oldest two evicted.
        for i in 0..6 {
            feed_pc(&mut s, 100 + i * 5, "Sigdis", 10);
        }
        let series = s.build_players_series(ts(200), 5, 4, SeriesMode::All);
        assert_eq!(series.buckets.len(), 4);
        // Newest-first: first bucket covers t=125, last t=110.
        assert_eq!(series.buckets[0].total_damage, 10);
        assert_eq!(series.buckets.len(), 4);
    }

    #[test]
    fn test_series_actor_ties_break_alphabetically() {
        let mut s = EncounterSegmenter::new(Duration::seconds(8), "");
        feed_pc(&mut s, 100, "Sigdis", 10);
        feed_pc(&mut s, 100, "Genaenyu", 10);
        let series = s.build_players_series(ts(200), 5, 50, SeriesMode::All);
        assert_eq!(series.actors, vec!["Genaenyu".to_string(), "Sigdis".to_string()]);
    }
}
