use crate::types::{
    BucketSnapshotEntry, PublishBatchRequest, RoomSummary, ServerMessage,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_BUCKET_SEC: i64 = 5;
pub const DEFAULT_MAX_BUCKETS: usize = 120;
/// Per-subscriber outbound queue depth; a full queue drops the subscriber.
pub const SUBSCRIBER_QUEUE: usize = 64;

const DEDUPE_TTL_MS: i64 = 30_000;
const PUBLISHER_TTL_MS: i64 = 60_000;
const OFFSET_ALPHA: f64 = 0.2;

#[derive(Debug, Error)]
#[error("unauthorized")]
pub struct Unauthorized;

/// Exponentially weighted estimate of `server_recv - client_sent`.
#[derive(Debug, Default)]
struct OffsetState {
    init: bool,
    offset: f64,
}

impl OffsetState {
    fn update(&mut self, sample: f64) -> f64 {
        if !self.init {
            self.init = true;
            self.offset = sample;
        } else {
            self.offset = (1.0 - OFFSET_ALPHA) * self.offset + OFFSET_ALPHA * sample;
        }
        self.offset
    }
}

#[derive(Debug, Default)]
struct BucketAgg {
    damage_by_actor: BTreeMap<String, i64>,
    total_damage: i64,
}

struct RoomInner {
    token: String,
    subs: HashMap<u64, mpsc::Sender<String>>,
    next_sub_id: u64,

    last_seen_unix_ms: i64,
    last_flushed_bucket_start: i64,

    // publisher id -> last seen server time (unix ms), TTL-pruned
    publishers: HashMap<String, i64>,
    // dedupe fingerprint -> last seen server time (unix ms), TTL-pruned
    dedupe_last_seen: HashMap<String, i64>,
    publisher_offsets: HashMap<String, OffsetState>,

    bucket_sec: i64,
    max_buckets: usize,
    buckets: HashMap<i64, BucketAgg>,
    // bucket starts, ascending
    order: Vec<i64>,
}

/// One aggregation scope: token-gated, one bucket series, one subscriber
/// set. A single mutex serializes all state.
pub struct Room {
    pub id: String,
    inner: Mutex<RoomInner>,
}

impl Room {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Room {
            id: id.into(),
            inner: Mutex::new(RoomInner {
                token: token.into(),
                subs: HashMap::new(),
                next_sub_id: 0,
                last_seen_unix_ms: 0,
                last_flushed_bucket_start: -1,
                publishers: HashMap::new(),
                dedupe_last_seen: HashMap::new(),
                publisher_offsets: HashMap::new(),
                bucket_sec: DEFAULT_BUCKET_SEC,
                max_buckets: DEFAULT_MAX_BUCKETS,
                buckets: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// First presented token becomes the room secret; later callers must
    /// match it exactly.
    pub fn authorize(&self, token: &str) -> Result<(), Unauthorized> {
        let mut inner = self.lock();
        if inner.token.is_empty() {
            inner.token = token.to_string();
            return Ok(());
        }
        if inner.token != token {
            return Err(Unauthorized);
        }
        Ok(())
    }

    /// Register a subscriber. The current snapshot is enqueued before the
    /// sender becomes visible to broadcasts, so the snapshot is always
    /// the first message the subscriber reads.
    pub fn subscribe(&self, now_unix_ms: i64) -> (u64, mpsc::Receiver<String>) {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let snapshot = inner.snapshot_message();
        if let Ok(text) = serde_json::to_string(&snapshot) {
            let _ = tx.try_send(text);
        }
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subs.insert(id, tx);
        inner.last_seen_unix_ms = now_unix_ms;
        (id, rx)
    }

    pub fn unsubscribe(&self, sub_id: u64, now_unix_ms: i64) {
        let mut inner = self.lock();
        inner.subs.remove(&sub_id);
        inner.last_seen_unix_ms = now_unix_ms;
    }

    /// Serialize once and enqueue on every subscriber. A subscriber whose
    /// queue is full or closed is dropped; the room never blocks.
    pub fn broadcast(&self, msg: &ServerMessage) {
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };
        let mut inner = self.lock();
        let mut dead: Vec<u64> = Vec::new();
        for (id, tx) in &inner.subs {
            if tx.try_send(text.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!(room = %self.id, sub = id, "dropping slow subscriber");
            inner.subs.remove(&id);
        }
    }

    /// Apply one publisher batch: offset smoothing, dedupe, bucket
    /// aggregation, pruning. Returns the per-bucket deltas in ascending
    /// bucket order.
    pub fn ingest_batch(
        &self,
        server_recv_unix_ms: i64,
        req: &PublishBatchRequest,
    ) -> Vec<ServerMessage> {
        let mut inner = self.lock();
        inner.ingest_batch(server_recv_unix_ms, req)
    }

    /// Once-per-second completion flush: when the wall clock crosses a
    /// bucket boundary, emit the most recently completed bucket (empty
    /// payload if nothing aggregated there). Rooms without subscribers
    /// stay silent.
    pub fn flush_completed_bucket(&self, now_unix_ms: i64) -> Option<ServerMessage> {
        let mut inner = self.lock();
        if inner.subs.is_empty() {
            return None;
        }
        let bucket_ms = inner.bucket_sec * 1000;
        let cur_start = now_unix_ms - now_unix_ms.rem_euclid(bucket_ms);
        if cur_start == inner.last_flushed_bucket_start {
            return None;
        }
        let publish_start = (cur_start - bucket_ms).max(0);
        inner.last_flushed_bucket_start = cur_start;

        let (damage_by_actor, total_damage) = match inner.buckets.get(&publish_start) {
            Some(agg) => (agg.damage_by_actor.clone(), agg.total_damage),
            None => (BTreeMap::new(), 0),
        };
        Some(ServerMessage::BucketUpdate {
            bucket_sec: inner.bucket_sec,
            bucket_start_unix_ms: publish_start,
            damage_by_actor,
            total_damage,
        })
    }

    pub fn snapshot(&self) -> ServerMessage {
        self.lock().snapshot_message()
    }

    pub fn summary(&self, now_unix_ms: i64) -> RoomSummary {
        let inner = self.lock();
        let cutoff = now_unix_ms - PUBLISHER_TTL_MS;
        let publisher_count = inner.publishers.values().filter(|last| **last >= cutoff).count();
        RoomSummary {
            room_id: self.id.clone(),
            last_seen_unix_ms: inner.last_seen_unix_ms,
            publisher_count,
            subscriber_count: inner.subs.len(),
            bucket_sec: inner.bucket_sec,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn bucket_starts(&self) -> Vec<i64> {
        self.lock().order.clone()
    }

    #[cfg(test)]
    fn bucket(&self, start: i64) -> Option<(BTreeMap<String, i64>, i64)> {
        let inner = self.lock();
        inner
            .buckets
            .get(&start)
            .map(|agg| (agg.damage_by_actor.clone(), agg.total_damage))
    }
}

impl RoomInner {
    fn ingest_batch(
        &mut self,
        server_recv_unix_ms: i64,
        req: &PublishBatchRequest,
    ) -> Vec<ServerMessage> {
        self.last_seen_unix_ms = server_recv_unix_ms;
        if !req.publisher_id.is_empty() {
            self.publishers
                .insert(req.publisher_id.clone(), server_recv_unix_ms);
        }

        let offset_sample = (server_recv_unix_ms - req.sent_at_unix_ms) as f64;
        let offset_ms = self
            .publisher_offsets
            .entry(req.publisher_id.clone())
            .or_default()
            .update(offset_sample);

        struct PendingUpdate {
            damage_by_actor: BTreeMap<String, i64>,
            total_damage: i64,
        }
        let mut updates_by_bucket: HashMap<i64, PendingUpdate> = HashMap::new();

        for ev in &req.events {
            // The publisher gates on PC-like actors; enforce the same
            // predicate here so one misbehaving client cannot pollute the
            // shared series.
            if !is_pc_like_actor_name(&ev.actor) {
                continue;
            }

            let ts_adj = (ev.ts_unix_ms as f64 + offset_ms) as i64;
            let fingerprint = dedupe_key(ev, ts_adj.div_euclid(1000));
            if let Some(last) = self.dedupe_last_seen.get(&fingerprint) {
                if server_recv_unix_ms - last <= DEDUPE_TTL_MS {
                    continue;
                }
            }
            self.dedupe_last_seen
                .insert(fingerprint, server_recv_unix_ms);

            let bucket_ms = self.bucket_sec * 1000;
            let bucket_start = ts_adj - ts_adj.rem_euclid(bucket_ms);
            if !self.buckets.contains_key(&bucket_start) {
                self.buckets.insert(bucket_start, BucketAgg::default());
                let idx = self.order.partition_point(|bs| *bs < bucket_start);
                self.order.insert(idx, bucket_start);
            }
            let agg = self.buckets.get_mut(&bucket_start).expect("bucket");
            *agg.damage_by_actor.entry(ev.actor.clone()).or_insert(0) += ev.amount;
            agg.total_damage += ev.amount;

            let actor_total = agg.damage_by_actor[&ev.actor];
            let total = agg.total_damage;
            let upd = updates_by_bucket
                .entry(bucket_start)
                .or_insert_with(|| PendingUpdate {
                    damage_by_actor: BTreeMap::new(),
                    total_damage: 0,
                });
            upd.damage_by_actor.insert(ev.actor.clone(), actor_total);
            upd.total_damage = total;
        }

        self.prune(server_recv_unix_ms);

        // Emit in bucket-start ascending order; updates for buckets the
        // prune just removed are dropped with them.
        let mut out = Vec::with_capacity(updates_by_bucket.len());
        for bs in &self.order {
            if let Some(upd) = updates_by_bucket.remove(bs) {
                out.push(ServerMessage::BucketUpdate {
                    bucket_sec: self.bucket_sec,
                    bucket_start_unix_ms: *bs,
                    damage_by_actor: upd.damage_by_actor,
                    total_damage: upd.total_damage,
                });
            }
        }
        out
    }

    fn snapshot_message(&self) -> ServerMessage {
        let mut actor_totals: HashMap<String, i64> = HashMap::new();
        let mut buckets = Vec::with_capacity(self.order.len());

        // Newest-first bucket list.
        for bs in self.order.iter().rev() {
            let Some(agg) = self.buckets.get(bs) else {
                continue;
            };
            for (actor, v) in &agg.damage_by_actor {
                *actor_totals.entry(actor.clone()).or_insert(0) += v;
            }
            buckets.push(BucketSnapshotEntry {
                bucket_start_unix_ms: *bs,
                damage_by_actor: agg.damage_by_actor.clone(),
                total_damage: agg.total_damage,
            });
        }

        let mut actors: Vec<String> = actor_totals.keys().cloned().collect();
        actors.sort_by(|a, b| {
            actor_totals[b]
                .cmp(&actor_totals[a])
                .then_with(|| a.cmp(b))
        });

        ServerMessage::BucketSnapshot {
            bucket_sec: self.bucket_sec,
            actors,
            buckets,
        }
    }

    fn prune(&mut self, now_unix_ms: i64) {
        self.dedupe_last_seen
            .retain(|_, last| now_unix_ms - *last <= DEDUPE_TTL_MS);

        // Rolling window by count.
        if self.order.len() > self.max_buckets {
            let excess = self.order.len() - self.max_buckets;
            for bs in self.order.drain(..excess) {
                self.buckets.remove(&bs);
            }
        }

        // Rolling window by age.
        let min_start = now_unix_ms - self.max_buckets as i64 * self.bucket_sec * 1000;
        let cut = self.order.partition_point(|bs| *bs < min_start);
        if cut > 0 {
            for bs in self.order.drain(..cut) {
                self.buckets.remove(&bs);
            }
        }

        self.publishers
            .retain(|_, last| now_unix_ms - *last <= PUBLISHER_TTL_MS);
    }
}

/// SHA-256 over the event identity plus its second-resolution adjusted
/// timestamp. Identical events from different publishers collapse onto
/// one fingerprint.
fn dedupe_key(ev: &crate::types::DamageEvent, t_rounded_sec: i64) -> String {
    let mut h = Sha256::new();
    h.update(ev.actor.as_bytes());
    h.update(b"|");
    h.update(ev.target.as_bytes());
    h.update(b"|");
    h.update(ev.kind.as_bytes());
    h.update(b"|");
    h.update(ev.verb.as_bytes());
    h.update(b"|");
    h.update(ev.amount.to_string().as_bytes());
    h.update(b"|");
    h.update(t_rounded_sec.to_string().as_bytes());
    format!("{:x}", h.finalize())
}

/// Wire-level actor gate: single token, 3-20 chars, leading ASCII
/// uppercase, body restricted to letters, apostrophe and hyphen.
pub fn is_pc_like_actor_name(s: &str) -> bool {
    let s = s.trim();
    if s.len() < 3 || s.len() > 20 {
        return false;
    }
    let bytes = s.as_bytes();
    if !bytes[0].is_ascii_uppercase() {
        return false;
    }
    bytes
        .iter()
        .all(|c| c.is_ascii_alphabetic() || *c == b'\'' || *c == b'-')
}
