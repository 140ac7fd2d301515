//! Live room subscriber: connects to a hub room over WebSocket, keeps a
//! newest-first copy of the bucket series, and renders it once per
//! second. Reconnects with capped exponential backoff.

use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const DEFAULT_MAX_KEEP: usize = 100;
const READ_DEADLINE: Duration = Duration::from_secs(60);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A connection that lived at least this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub hub_url: String,
    pub room_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBucket {
    bucket_start_unix_ms: i64,
    #[serde(default)]
    damage_by_actor: HashMap<String, i64>,
    total_damage: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    #[serde(rename_all = "camelCase")]
    BucketSnapshot {
        bucket_sec: i64,
        #[serde(default)]
        actors: Vec<String>,
        #[serde(default)]
        buckets: Vec<WireBucket>,
    },
    #[serde(rename_all = "camelCase")]
    BucketUpdate {
        bucket_sec: i64,
        bucket_start_unix_ms: i64,
        #[serde(default)]
        damage_by_actor: HashMap<String, i64>,
        total_damage: i64,
    },
}

/// Client-side copy of the room's bucket series, newest bucket first.
#[derive(Debug, Default)]
struct RemoteSeries {
    bucket_sec: i64,
    actors: Vec<String>,
    buckets: Vec<WireBucket>,
    max_keep: usize,
}

impl RemoteSeries {
    fn new(max_keep: usize) -> Self {
        Self {
            max_keep: if max_keep == 0 {
                DEFAULT_MAX_KEEP
            } else {
                max_keep
            },
            ..Default::default()
        }
    }

    fn apply(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::BucketSnapshot {
                bucket_sec,
                actors,
                buckets,
            } => {
                self.bucket_sec = bucket_sec;
                self.actors = actors.into_iter().filter(|a| !a.trim().is_empty()).collect();
                self.buckets = buckets
                    .into_iter()
                    .filter(|b| b.bucket_start_unix_ms > 0)
                    .collect();
                self.sort_and_trim();
            }
            WireMessage::BucketUpdate {
                bucket_sec,
                bucket_start_unix_ms,
                damage_by_actor,
                total_damage,
            } => {
                if bucket_start_unix_ms <= 0 {
                    return;
                }
                self.bucket_sec = bucket_sec;
                for actor in damage_by_actor.keys() {
                    if !self.actors.iter().any(|a| a == actor) {
                        self.actors.push(actor.clone());
                    }
                }
                let bucket = WireBucket {
                    bucket_start_unix_ms,
                    damage_by_actor,
                    total_damage,
                };
                match self
                    .buckets
                    .iter_mut()
                    .find(|b| b.bucket_start_unix_ms == bucket_start_unix_ms)
                {
                    Some(existing) => *existing = bucket,
                    None => self.buckets.insert(0, bucket),
                }
                self.sort_and_trim();
            }
        }
    }

    fn sort_and_trim(&mut self) {
        self.buckets
            .sort_by(|a, b| b.bucket_start_unix_ms.cmp(&a.bucket_start_unix_ms));
        if self.buckets.len() > self.max_keep {
            self.buckets.truncate(self.max_keep);
        }
    }

    fn render(&self) {
        println!();
        if !self.actors.is_empty() {
            println!("actors: {}", self.actors.join(", "));
        }
        println!("{:<24} {:>12}  per-actor", "bucket start", "total");
        for b in self.buckets.iter().take(12) {
            let mut actors: Vec<(&String, &i64)> = b.damage_by_actor.iter().collect();
            actors.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let detail = actors
                .iter()
                .map(|(a, v)| format!("{a}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "{:<24} {:>12}  {}",
                chrono::DateTime::from_timestamp_millis(b.bucket_start_unix_ms)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                b.total_damage,
                detail
            );
        }
    }
}

pub async fn run(cfg: WatchConfig) -> Result<(), String> {
    let ws_url = build_ws_url(&cfg.hub_url, &cfg.room_id, &cfg.token)?;
    let mut series = RemoteSeries::new(DEFAULT_MAX_KEEP);
    let mut backoff = BACKOFF_START;

    loop {
        match connect_async(ws_url.as_str()).await {
            Ok((mut stream, _resp)) => {
                info!(room = %cfg.room_id, "subscribed");
                let connected_at = Instant::now();
                let err = read_loop(&mut stream, &mut series).await;
                if let Some(msg) = err {
                    warn!(room = %cfg.room_id, error = %msg, "subscription closed");
                }
                backoff = if connected_at.elapsed() >= STABLE_CONNECTION {
                    BACKOFF_START
                } else {
                    next_backoff(backoff)
                };
            }
            Err(e) => {
                warn!(room = %cfg.room_id, error = %e, "connect failed");
                backoff = next_backoff(backoff);
            }
        }

        let delay = with_jitter(backoff, rand::thread_rng().gen_range(-1.0..1.0));
        info!(room = %cfg.room_id, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn read_loop<S>(
    stream: &mut tokio_tungstenite::WebSocketStream<S>,
    series: &mut RemoteSeries,
) -> Option<String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut dirty = false;
    let mut render_tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            frame = timeout(READ_DEADLINE, stream.next()) => {
                match frame {
                    Err(_) => return Some("read deadline exceeded".to_string()),
                    Ok(None) => return None,
                    Ok(Some(Err(e))) => return Some(e.to_string()),
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Ok(msg) = serde_json::from_str::<WireMessage>(&text) {
                            series.apply(msg);
                            dirty = true;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) => return None,
                    // Pings are answered by the protocol layer on the
                    // next read; pongs and binary frames are ignored.
                    Ok(Some(Ok(_))) => {}
                }
            }
            _ = render_tick.tick() => {
                if dirty {
                    series.render();
                    dirty = false;
                }
            }
        }
    }
}

fn build_ws_url(hub_url: &str, room_id: &str, token: &str) -> Result<String, String> {
    let mut url =
        reqwest::Url::parse(hub_url.trim()).map_err(|e| format!("invalid hub url: {e}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(format!("unsupported scheme {other:?}")),
    };
    url.set_scheme(scheme).map_err(|_| "invalid scheme".to_string())?;
    url.set_path(&format!("/v1/rooms/{room_id}/ws"));
    url.set_query(Some(&format!("token={}", token.trim())));
    Ok(url.to_string())
}

fn next_backoff(cur: Duration) -> Duration {
    (cur * 2).clamp(BACKOFF_START, BACKOFF_CAP)
}

/// +/-20% jitter; `unit` must be in [-1, 1].
fn with_jitter(backoff: Duration, unit: f64) -> Duration {
    let factor = 1.0 + unit * 0.2;
    backoff.mul_f64(factor.max(0.0))
}
