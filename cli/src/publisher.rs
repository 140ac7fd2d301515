//! Hub publisher client: a bounded ring of outgoing damage events,
//! batch-POSTed to a room on a fixed tick.

use rand::RngCore;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub const DEFAULT_HUB_URL: &str = "http://127.0.0.1:8787";

const RING_CAPACITY: usize = 4096;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const FLUSH_MAX_EVENTS: usize = 500;
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HubDamageEvent {
    pub ts_unix_ms: i64,
    pub actor: String,
    pub target: String,
    /// "melee" | "nonmelee"
    pub kind: String,
    pub verb: String,
    pub amount: i64,
    pub crit: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishBatchRequest<'a> {
    publisher_id: &'a str,
    sent_at_unix_ms: i64,
    events: &'a [HubDamageEvent],
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub hub_url: String,
    pub room_id: String,
    pub room_token: String,
    pub publisher_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PublisherStatus {
    pub sent_events: u64,
    pub dropped_non_pc_actor_events: u64,
    pub last_error: String,
}

struct PublisherInner {
    buf: VecDeque<HubDamageEvent>,
    status: PublisherStatus,
}

/// Bounded-buffer batch publisher. Enqueue never blocks: a full ring
/// overwrites its oldest event, and a failed POST is simply retried with
/// whatever the next tick drains.
pub struct HubPublisher {
    cfg: PublisherConfig,
    client: reqwest::Client,
    inner: Mutex<PublisherInner>,
}

impl HubPublisher {
    pub fn new(mut cfg: PublisherConfig) -> Result<Arc<Self>, String> {
        if cfg.hub_url.is_empty() {
            cfg.hub_url = DEFAULT_HUB_URL.to_string();
        }
        reqwest::Url::parse(&cfg.hub_url).map_err(|e| format!("invalid hub url: {e}"))?;
        cfg.hub_url = cfg.hub_url.trim_end_matches('/').to_string();

        if cfg.room_id.is_empty() {
            return Err("room id required".to_string());
        }
        if cfg.room_token.is_empty() {
            return Err("room token required".to_string());
        }
        if cfg.publisher_id.is_empty() {
            cfg.publisher_id = format!("pub-{}", rand_hex(8));
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| format!("http client: {e}"))?;

        Ok(Arc::new(Self {
            cfg,
            client,
            inner: Mutex::new(PublisherInner {
                buf: VecDeque::with_capacity(RING_CAPACITY),
                status: PublisherStatus::default(),
            }),
        }))
    }

    /// Accept a candidate event. Only PC-like actors go on the wire;
    /// everything else increments the dropped counter.
    pub fn enqueue(&self, ev: HubDamageEvent) {
        let mut inner = self.lock();
        if !is_pc_like_actor_name(&ev.actor) {
            inner.status.dropped_non_pc_actor_events += 1;
            return;
        }
        if inner.buf.len() == RING_CAPACITY {
            inner.buf.pop_front();
        }
        inner.buf.push_back(ev);
    }

    pub fn status(&self) -> PublisherStatus {
        self.lock().status.clone()
    }

    /// Background flush loop; runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        let mut last_stats = tokio::time::Instant::now();
        loop {
            tick.tick().await;
            self.flush_once(FLUSH_MAX_EVENTS).await;
            if last_stats.elapsed() >= STATS_INTERVAL {
                last_stats = tokio::time::Instant::now();
                let st = self.status();
                info!(
                    sent = st.sent_events,
                    dropped_non_pc = st.dropped_non_pc_actor_events,
                    "hub publisher stats"
                );
            }
        }
    }

    async fn flush_once(&self, max_events: usize) {
        let batch = self.drain(max_events);
        if batch.is_empty() {
            return;
        }

        let sent_at = now_unix_ms();
        let payload = PublishBatchRequest {
            publisher_id: &self.cfg.publisher_id,
            sent_at_unix_ms: sent_at,
            events: &batch,
        };
        let url = format!(
            "{}/v1/rooms/{}/events",
            self.cfg.hub_url, self.cfg.room_id
        );

        let res = self
            .client
            .post(&url)
            .header("X-EQLog-Token", &self.cfg.room_token)
            .json(&payload)
            .send()
            .await;

        let mut inner = self.lock();
        match res {
            Ok(resp) if resp.status().is_success() => {
                inner.status.sent_events += batch.len() as u64;
                inner.status.last_error.clear();
                debug!(events = batch.len(), "hub batch published");
            }
            Ok(resp) => {
                inner.status.last_error = format!("hub returned {}", resp.status());
            }
            Err(e) => {
                inner.status.last_error = e.to_string();
            }
        }
    }

    fn drain(&self, max_events: usize) -> Vec<HubDamageEvent> {
        let mut inner = self.lock();
        let n = max_events.min(inner.buf.len());
        inner.buf.drain(..n).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PublisherInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Actors eligible for publication: single token, 3-20 chars, leading
/// ASCII uppercase, body restricted to letters, apostrophe and hyphen.
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

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn rand_hex(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(n_bytes * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(ts: i64, actor: &str, amount: i64) -> HubDamageEvent {
        HubDamageEvent {
            ts_unix_ms: ts,
            actor: actor.to_string(),
            target: "a rat".to_string(),
            kind: "melee".to_string(),
            verb: "slashes".to_string(),
            amount,
            crit: false,
        }
    }

    fn test_publisher() -> Arc<HubPublisher> {
        HubPublisher::new(PublisherConfig {
            hub_url: DEFAULT_HUB_URL.to_string(),
            room_id: "r1".to_string(),
            room_token: "t1".to_string(),
            publisher_id: "p1".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_enqueue_gates_non_pc_actors() {
        let p = test_publisher();
        p.enqueue(ev(1, "Sigdis", 10));
        p.enqueue(ev(2, "Lord Hydrerious", 10));
        p.enqueue(ev(3, "a training dummy", 10));

        let st = p.status();
        assert_eq!(st.dropped_non_pc_actor_events, 2);
        assert_eq!(p.drain(100).len(), 1);
    }

    #[test]
    fn test_ring_overwrites_oldest_when_full() {
        let p = test_publisher();
        for i in 0..(RING_CAPACITY as i64 + 10) {
            p.enqueue(ev(i, "Sigdis", i));
        }
        let drained = p.drain(usize::MAX);
        assert_eq!(drained.len(), RING_CAPACITY);
        // The ten oldest events were overwritten.
        assert_eq!(drained[0].ts_unix_ms, 10);
    }

    #[test]
    fn test_drain_respects_flush_cap() {
        let p = test_publisher();
        for i in 0..600 {
            p.enqueue(ev(i, "Sigdis", 1));
        }
        let first = p.drain(FLUSH_MAX_EVENTS);
        assert_eq!(first.len(), 500);
        let second = p.drain(FLUSH_MAX_EVENTS);
        assert_eq!(second.len(), 100);
        // Order preserved across drains.
        assert_eq!(first[0].ts_unix_ms, 0);
        assert_eq!(second[0].ts_unix_ms, 500);
    }

    #[test]
    fn test_new_defaults_publisher_id() {
        let p = HubPublisher::new(PublisherConfig {
            hub_url: String::new(),
            room_id: "r1".to_string(),
            room_token: "t1".to_string(),
            publisher_id: String::new(),
        })
        .unwrap();
        assert!(p.cfg.publisher_id.starts_with("pub-"));
        assert_eq!(p.cfg.publisher_id.len(), 4 + 16);
        assert_eq!(p.cfg.hub_url, DEFAULT_HUB_URL);
    }

    #[test]
    fn test_new_requires_room_and_token() {
        assert!(HubPublisher::new(PublisherConfig {
            hub_url: String::new(),
            room_id: String::new(),
            room_token: "t".to_string(),
            publisher_id: String::new(),
        })
        .is_err());
        assert!(HubPublisher::new(PublisherConfig {
            hub_url: String::new(),
            room_id: "r".to_string(),
            room_token: String::new(),
            publisher_id: String::new(),
        })
        .is_err());
    }

    #[test]
    fn test_batch_serializes_camel_case() {
        let events = vec![ev(10_500, "Sigdis", 100)];
        let payload = PublishBatchRequest {
            publisher_id: "p1",
            sent_at_unix_ms: 50_000,
            events: &events,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"publisherId\":\"p1\""));
        assert!(json.contains("\"sentAtUnixMs\":50000"));
        assert!(json.contains("\"tsUnixMs\":10500"));
    }
}
