use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::types::{ErrorResponse, OkResponse, PublishBatchRequest, RoomsListResponse};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

const TOKEN_HEADER: &str = "x-eqlog-token";
const BODY_LIMIT: u64 = 4 * 1024 * 1024;
const PING_PERIOD: Duration = Duration::from_secs(20);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub struct ServerState {
    pub rooms: RoomRegistry,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            rooms: RoomRegistry::new(),
        }
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn with_state(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (Arc<ServerState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Full route tree: room listing, batch ingestion, subscriber upgrade.
pub fn routes(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let list_rooms = warp::path!("v1" / "rooms")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_list_rooms);

    let post_events = warp::path!("v1" / "rooms" / String / "events")
        .and(warp::post())
        .and(warp::header::optional::<String>(TOKEN_HEADER))
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_post_events);

    let ws = warp::path!("v1" / "rooms" / String / "ws")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(with_state(state))
        .and_then(handle_ws);

    list_rooms
        .or(post_events)
        .or(ws)
        .recover(handle_rejection)
}

async fn handle_list_rooms(
    query: HashMap<String, String>,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    // activeOnly defaults to true; only an explicit false/0 disables it.
    let active_only = match query.get("activeOnly").map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "false" || v == "0" => false,
        _ => true,
    };
    let rooms = state.rooms.list_rooms(now_unix_ms(), active_only);
    Ok(warp::reply::json(&RoomsListResponse { rooms }))
}

async fn handle_post_events(
    room_id: String,
    token: Option<String>,
    req: PublishBatchRequest,
    state: Arc<ServerState>,
) -> Result<warp::reply::WithStatus<warp::reply::Json>, Rejection> {
    let token = token.map(|t| t.trim().to_string()).unwrap_or_default();
    if token.is_empty() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                error: "missing token",
            }),
            StatusCode::UNAUTHORIZED,
        ));
    }

    let server_recv = now_unix_ms();
    let room = match state.rooms.get_or_create(&room_id, &token) {
        Ok(room) => room,
        Err(_) => {
            return Ok(warp::reply::with_status(
                warp::reply::json(&ErrorResponse {
                    error: "unauthorized",
                }),
                StatusCode::UNAUTHORIZED,
            ));
        }
    };

    debug!(room = %room_id, publisher = %req.publisher_id, events = req.events.len(), "ingest batch");
    let updates = room.ingest_batch(server_recv, &req);
    for update in &updates {
        room.broadcast(update);
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&OkResponse { ok: true }),
        StatusCode::OK,
    ))
}

async fn handle_ws(
    room_id: String,
    query: HashMap<String, String>,
    ws: warp::ws::Ws,
    state: Arc<ServerState>,
) -> Result<Box<dyn Reply>, Rejection> {
    let token = query
        .get("token")
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if token.is_empty() {
        warn!(room = %room_id, "ws unauthorized: missing token");
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                error: "missing token",
            }),
            StatusCode::UNAUTHORIZED,
        )));
    }

    let room = match state.rooms.get_or_create(&room_id, &token) {
        Ok(room) => room,
        Err(_) => {
            warn!(room = %room_id, "ws unauthorized: bad token");
            return Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&ErrorResponse {
                    error: "unauthorized",
                }),
                StatusCode::UNAUTHORIZED,
            )));
        }
    };

    Ok(Box::new(
        ws.on_upgrade(move |socket| subscriber_connected(socket, room)),
    ))
}

/// One subscriber session: a sender task draining the bounded queue with
/// a periodic ping, and a read loop whose 60 s deadline is refreshed by
/// any inbound frame (pongs included).
async fn subscriber_connected(socket: WebSocket, room: Arc<Room>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sub_id, mut rx) = room.subscribe(now_unix_ms());
    info!(room = %room.id, sub = sub_id, "ws connect");

    let send_room = room.clone();
    let send_task = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(text) = maybe else { break };
                    match timeout(WRITE_DEADLINE, ws_tx.send(Message::text(text))).await {
                        Ok(Ok(())) => {}
                        _ => {
                            debug!(room = %send_room.id, "ws write failed or timed out");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    match timeout(WRITE_DEADLINE, ws_tx.send(Message::ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        _ => {
                            debug!(room = %send_room.id, "ws ping failed");
                            break;
                        }
                    }
                }
            }
        }
    });

    loop {
        match timeout(READ_DEADLINE, ws_rx.next()).await {
            Ok(Some(Ok(_frame))) => continue,
            Ok(_) => break,
            Err(_) => {
                debug!(room = %room.id, sub = sub_id, "ws read deadline exceeded");
                break;
            }
        }
    }

    room.unsubscribe(sub_id, now_unix_ms());
    send_task.abort();
    info!(room = %room.id, sub = sub_id, "ws disconnect");
}

/// Iterate all rooms once per second, broadcasting any completed-bucket
/// flush. Room locks are taken one at a time.
pub async fn flush_loop(state: Arc<ServerState>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let now = now_unix_ms();
        for room in state.rooms.all_rooms() {
            if let Some(msg) = room.flush_completed_bucket(now) {
                room.broadcast(&msg);
            }
        }
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                error: "invalid json",
            }),
            StatusCode::BAD_REQUEST,
        ));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                error: "method not allowed",
            }),
            StatusCode::METHOD_NOT_ALLOWED,
        ));
    }
    if err.is_not_found() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse { error: "not found" }),
            StatusCode::NOT_FOUND,
        ));
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerMessage;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState::new())
    }

    const EMPTY_BATCH: &str = r#"{"publisherId":"p1","sentAtUnixMs":1,"events":[]}"#;

    #[tokio::test]
    async fn test_post_events_token_auth_and_ok() {
        let state = test_state();
        let api = routes(state);

        // First use sets the room token.
        let res = warp::test::request()
            .method("POST")
            .path("/v1/rooms/r1/events")
            .header("content-type", "application/json")
            .header("x-eqlog-token", "t1")
            .body(EMPTY_BATCH)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(String::from_utf8_lossy(res.body()).contains("\"ok\":true"));

        // Wrong token rejected.
        let res = warp::test::request()
            .method("POST")
            .path("/v1/rooms/r1/events")
            .header("content-type", "application/json")
            .header("x-eqlog-token", "wrong")
            .body(EMPTY_BATCH)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // Missing token rejected.
        let res = warp::test::request()
            .method("POST")
            .path("/v1/rooms/r2/events")
            .header("content-type", "application/json")
            .body(EMPTY_BATCH)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_post_events_rejects_unknown_fields() {
        let state = test_state();
        let api = routes(state);

        let res = warp::test::request()
            .method("POST")
            .path("/v1/rooms/r1/events")
            .header("content-type", "application/json")
            .header("x-eqlog-token", "t1")
            .body(r#"{"publisherId":"p1","sentAtUnixMs":1,"events":[],"bogus":1}"#)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_events_rejects_malformed_json() {
        let state = test_state();
        let api = routes(state);

        let res = warp::test::request()
            .method("POST")
            .path("/v1/rooms/r1/events")
            .header("content-type", "application/json")
            .header("x-eqlog-token", "t1")
            .body("{not json")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_rooms_includes_active_room() {
        let state = test_state();
        let api = routes(state);

        let res = warp::test::request()
            .method("POST")
            .path("/v1/rooms/r1/events")
            .header("content-type", "application/json")
            .header("x-eqlog-token", "t1")
            .body(EMPTY_BATCH)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .method("GET")
            .path("/v1/rooms")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: RoomsListResponse = serde_json::from_slice(res.body()).unwrap();
        let room = body
            .rooms
            .iter()
            .find(|r| r.room_id == "r1")
            .expect("room r1 listed");
        assert!(room.publisher_count >= 1);
    }

    #[tokio::test]
    async fn test_list_rooms_active_only_false_shows_idle_rooms() {
        let state = test_state();
        state.rooms.get_or_create("idle", "t").unwrap();
        let api = routes(state);

        let res = warp::test::request()
            .method("GET")
            .path("/v1/rooms?activeOnly=false")
            .reply(&api)
            .await;
        let body: RoomsListResponse = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.rooms.len(), 1);

        let res = warp::test::request()
            .method("GET")
            .path("/v1/rooms")
            .reply(&api)
            .await;
        let body: RoomsListResponse = serde_json::from_slice(res.body()).unwrap();
        assert!(body.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_list_rooms_trailing_slash_and_no_slash() {
        let state = test_state();
        let api = routes(state);

        for path in ["/v1/rooms", "/v1/rooms/"] {
            let res = warp::test::request().method("GET").path(path).reply(&api).await;
            assert_eq!(res.status(), StatusCode::OK, "path {path}");
            let body: RoomsListResponse = serde_json::from_slice(res.body()).unwrap();
            assert!(body.rooms.is_empty());
        }
    }

    #[tokio::test]
    async fn test_ws_initial_snapshot() {
        let state = test_state();
        let api = routes(state);

        let mut client = warp::test::ws()
            .path("/v1/rooms/r1/ws?token=t1")
            .handshake(api)
            .await
            .expect("handshake");

        let msg = client.recv().await.expect("first message");
        let text = msg.to_str().expect("text frame");
        let parsed: ServerMessage = serde_json::from_str(text).unwrap();
        assert!(matches!(parsed, ServerMessage::BucketSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_ws_missing_token_rejected() {
        let state = test_state();
        let api = routes(state);

        let res = warp::test::request()
            .method("GET")
            .path("/v1/rooms/r1/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_method_rejected() {
        let state = test_state();
        let api = routes(state);

        let res = warp::test::request()
            .method("GET")
            .path("/v1/rooms/r1/events")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
