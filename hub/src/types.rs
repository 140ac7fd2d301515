//! Wire types for the hub protocol. Field names follow the JSON contract
//! (camelCase); unknown fields in inbound bodies are rejected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One outgoing damage event as published by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DamageEvent {
    pub ts_unix_ms: i64,
    pub actor: String,
    pub target: String,
    /// "melee" | "nonmelee"
    pub kind: String,
    pub verb: String,
    pub amount: i64,
    #[serde(default)]
    pub crit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PublishBatchRequest {
    pub publisher_id: String,
    pub sent_at_unix_ms: i64,
    pub events: Vec<DamageEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketSnapshotEntry {
    pub bucket_start_unix_ms: i64,
    pub damage_by_actor: BTreeMap<String, i64>,
    pub total_damage: i64,
}

/// Server-to-subscriber messages. The `type` tag matches the protocol
/// strings `bucket_snapshot` / `bucket_update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    BucketSnapshot {
        bucket_sec: i64,
        actors: Vec<String>,
        buckets: Vec<BucketSnapshotEntry>,
    },
    #[serde(rename_all = "camelCase")]
    BucketUpdate {
        bucket_sec: i64,
        bucket_start_unix_ms: i64,
        damage_by_actor: BTreeMap<String, i64>,
        total_damage: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub last_seen_unix_ms: i64,
    pub publisher_count: usize,
    pub subscriber_count: usize,
    pub bucket_sec: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsListResponse {
    pub rooms: Vec<RoomSummary>,
}
