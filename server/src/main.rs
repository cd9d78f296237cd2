use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

mod auth;
mod config;
mod error;
mod protocol;
mod state;

use auth::{bearer_token, TokenIssuer, TokenResponse, UserProfile};
use config::Config;
use error::ApiError;
use protocol::{ClientRequest, Outbound, RoomJoined};
use state::{JoinError, JoinOutcome, LeaveOutcome, ServerState};

type ClientSender = mpsc::UnboundedSender<Outbound>;
type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

#[derive(Clone)]
struct AppState {
    server_state: ServerState,
    client_senders: ClientSenders,
    tokens: TokenIssuer,
}

impl AppState {
    fn new(config: &Config) -> Self {
        Self {
            server_state: ServerState::new(),
            client_senders: Arc::new(RwLock::new(HashMap::new())),
            tokens: TokenIssuer::new(config.token_ttl),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_server=debug,info".into()),
        )
        .init();

    let config = Config::load();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(&config));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Watch party relay listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .route("/api/auth/guest", post(guest_login))
        .route("/api/auth/refresh", post(refresh_login))
        .route("/api/me", get(current_user))
        .route("/api/rooms/:room_id", get(room_details))
        .with_state(app_state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn ws_endpoint(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let display_name = params
        .token
        .as_deref()
        .and_then(|token| state.tokens.verify(token).ok())
        .map(|user| user.display_name);
    ws.on_upgrade(move |socket| handle_connection(socket, state, display_name))
}

#[derive(Debug, Deserialize)]
struct GuestRequest {
    #[serde(default)]
    display_name: Option<String>,
}

async fn guest_login(
    State(state): State<AppState>,
    Json(request): Json<GuestRequest>,
) -> Json<TokenResponse> {
    Json(state.tokens.issue_guest(request.display_name.as_deref()))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh_login(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    Ok(Json(state.tokens.refresh(&request.refresh_token)?))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserProfile, ApiError> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    Ok(state.tokens.verify(bearer_token(header)?)?)
}

async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, ApiError> {
    authenticate(&state, &headers).map(Json)
}

async fn room_details(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &headers)?;
    let server_state = &state.server_state;
    let (members, capacity) = server_state
        .room_snapshot(&room_id)
        .await
        .ok_or_else(|| ApiError::RoomNotFound(room_id.clone()))?;
    let passcode_enabled = server_state
        .rooms
        .get(&room_id)
        .map(|room| room.passcode_hash.is_some())
        .unwrap_or(false);

    Ok(Json(serde_json::json!({
        "room_id": room_id,
        "host_id": server_state.host_of(&room_id),
        "members": members,
        "capacity": capacity,
        "passcode_enabled": passcode_enabled,
    })))
}

async fn handle_connection(socket: WebSocket, state: AppState, display_name: Option<String>) {
    let server_state = state.server_state.clone();
    let client_senders = state.client_senders.clone();
    let client_id = Uuid::new_v4();
    server_state.add_client(client_id, display_name);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    client_senders.write().await.insert(client_id, tx.clone());

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match msg.to_json() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) =
                    handle_message(&text, client_id, &server_state, &client_senders).await
                {
                    tracing::warn!("Error handling message from {}: {}", client_id, e);
                    let _ = tx.send(Outbound::Error {
                        message: e.to_string(),
                    });
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Resume tokens survive the disconnect so the client can rejoin.
    client_senders.write().await.remove(&client_id);
    if let Some(outcome) = server_state.remove_client(client_id).await {
        announce_departure(&server_state, &client_senders, outcome).await;
    }
    send_task.abort();
}

async fn handle_message(
    text: &str,
    client_id: Uuid,
    state: &ServerState,
    client_senders: &ClientSenders,
) -> anyhow::Result<()> {
    match ClientRequest::parse(text)? {
        ClientRequest::CreateRoom(request) => {
            leave_current_room(client_id, state, client_senders).await;
            let outcome = state.create_room(
                client_id,
                request.passcode,
                request.display_name,
                request.capacity,
            );
            admit(client_id, outcome, state, client_senders).await;
        }

        ClientRequest::JoinRoom(request) => {
            if state.room_of(client_id).as_deref() != Some(request.room_id.as_str()) {
                leave_current_room(client_id, state, client_senders).await;
            }
            match state
                .join_room(
                    client_id,
                    &request.room_id,
                    request.passcode,
                    request.display_name,
                )
                .await
            {
                Ok(outcome) => admit(client_id, outcome, state, client_senders).await,
                Err(e) => send_to(client_senders, client_id, rejection(e)).await,
            }
        }

        ClientRequest::ResumeSession(request) => {
            leave_current_room(client_id, state, client_senders).await;
            match state
                .resume_session(client_id, &request.token, request.display_name)
                .await
            {
                Ok(outcome) => admit(client_id, outcome, state, client_senders).await,
                Err(e) => send_to(client_senders, client_id, rejection(e)).await,
            }
        }

        ClientRequest::LeaveRoom => {
            state.clear_session(client_id);
            leave_current_room(client_id, state, client_senders).await;
            send_to(client_senders, client_id, Outbound::RoomLeft).await;
        }

        ClientRequest::VideoSync(message) => match state.record_sync(client_id, message) {
            Ok(room_id) => {
                tracing::debug!(
                    "Relaying {:?} at {:.3}s from host {} in room {}",
                    message.action,
                    message.current_time,
                    client_id,
                    room_id
                );
                broadcast_to_room(
                    state,
                    client_senders,
                    &room_id,
                    Some(client_id),
                    Outbound::VideoSync { room_id: room_id.clone(), message },
                )
                .await;
            }
            Err(rejected) => {
                tracing::warn!("Dropped video_sync from {}: {}", client_id, rejected);
                send_to(
                    client_senders,
                    client_id,
                    Outbound::Error {
                        message: rejected.to_string(),
                    },
                )
                .await;
            }
        },

        ClientRequest::RequestSync => {
            if let Some(room_id) = state.room_of(client_id) {
                replay_sync(client_id, &room_id, state, client_senders).await;
            }
        }
    }

    Ok(())
}

/// Confirm membership, then bring the client up to date with the room.
async fn admit(
    client_id: Uuid,
    outcome: JoinOutcome,
    state: &ServerState,
    client_senders: &ClientSenders,
) {
    let resume_token = state.remember_session(client_id, &outcome.room_id);
    let room_id = outcome.room_id.clone();
    send_to(
        client_senders,
        client_id,
        Outbound::RoomJoined(RoomJoined {
            room_id: outcome.room_id,
            client_id,
            is_host: outcome.is_host,
            passcode_enabled: outcome.passcode_enabled,
            resume_token,
            capacity: outcome.capacity,
            display_name: outcome.display_name,
        }),
    )
    .await;
    if !outcome.is_host {
        replay_sync(client_id, &room_id, state, client_senders).await;
    }
    broadcast_member_update(state, client_senders, &room_id).await;
}

fn rejection(error: JoinError) -> Outbound {
    match error {
        JoinError::NotFound => Outbound::RoomNotFound,
        JoinError::Full { capacity } => Outbound::RoomFull { capacity },
        other => Outbound::Error {
            message: other.to_string(),
        },
    }
}

async fn leave_current_room(client_id: Uuid, state: &ServerState, client_senders: &ClientSenders) {
    if let Some(outcome) = state.leave_room(client_id).await {
        announce_departure(state, client_senders, outcome).await;
    }
}

async fn announce_departure(
    state: &ServerState,
    client_senders: &ClientSenders,
    outcome: LeaveOutcome,
) {
    if outcome.room_closed {
        return;
    }
    if let Some(host_id) = outcome.promoted_host {
        broadcast_to_room(
            state,
            client_senders,
            &outcome.room_id,
            None,
            Outbound::HostChanged {
                room_id: outcome.room_id.clone(),
                host_id,
            },
        )
        .await;
    }
    broadcast_member_update(state, client_senders, &outcome.room_id).await;
}

async fn replay_sync(
    client_id: Uuid,
    room_id: &str,
    state: &ServerState,
    client_senders: &ClientSenders,
) {
    if let Some(message) = state.catch_up(room_id) {
        send_to(
            client_senders,
            client_id,
            Outbound::VideoSync {
                room_id: room_id.to_string(),
                message,
            },
        )
        .await;
    }
}

async fn send_to(client_senders: &ClientSenders, client_id: Uuid, msg: Outbound) {
    if let Some(tx) = client_senders.read().await.get(&client_id) {
        let _ = tx.send(msg);
    }
}

async fn broadcast_to_room(
    state: &ServerState,
    client_senders: &ClientSenders,
    room_id: &str,
    except: Option<Uuid>,
    msg: Outbound,
) {
    let members = state.get_room_members(room_id).await;
    let senders = client_senders.read().await;

    for member_id in members.into_iter().filter(|id| Some(*id) != except) {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(msg.clone());
        }
    }
}

async fn broadcast_member_update(
    state: &ServerState,
    client_senders: &ClientSenders,
    room_id: &str,
) {
    if let Some((members, capacity)) = state.room_snapshot(room_id).await {
        broadcast_to_room(
            state,
            client_senders,
            room_id,
            None,
            Outbound::MemberUpdate {
                room_id: room_id.to_string(),
                members,
                capacity,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(&Config {
            port: 0,
            token_ttl: Duration::from_secs(60),
        })
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn guest_login_then_profile() {
        let app = router(test_state());

        let response = app
            .clone()
            .oneshot(post_json("/api/auth/guest", serde_json::json!({ "display_name": "Ana" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let tokens = json_body(response).await;
        let access = tokens["access_token"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/me")
                    .header("authorization", format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["display_name"], "Ana");

        let response = app
            .oneshot(Request::get("/api/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_tokens_are_single_use() {
        let app = router(test_state());
        let tokens = json_body(
            app.clone()
                .oneshot(post_json("/api/auth/guest", serde_json::json!({})))
                .await
                .unwrap(),
        )
        .await;
        let refresh = tokens["refresh_token"].clone();

        let first = app
            .clone()
            .oneshot(post_json("/api/auth/refresh", serde_json::json!({ "refresh_token": refresh })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let replayed = app
            .oneshot(post_json("/api/auth/refresh", serde_json::json!({ "refresh_token": refresh })))
            .await
            .unwrap();
        assert_eq!(replayed.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let state = test_state();
        let access = state.tokens.issue_guest(None).access_token;
        let response = router(state)
            .oneshot(
                Request::get("/api/rooms/000-000")
                    .header("authorization", format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    type TestSocket =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(test_state())).await.unwrap();
        });
        format!("ws://{addr}/ws")
    }

    async fn send(socket: &mut TestSocket, value: Value) {
        socket
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    /// Read frames until one of the given type arrives
    async fn next_of_kind(socket: &mut TestSocket, kind: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = socket.next().await.unwrap().unwrap();
                if let WsMessage::Text(text) = frame {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["type"] == kind {
                        return value;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
    }

    #[tokio::test]
    async fn relays_host_sync_and_rejects_viewer_sync() {
        let url = spawn_server().await;
        let (mut host, _) = connect_async(&url).await.unwrap();
        let (mut viewer, _) = connect_async(&url).await.unwrap();

        send(&mut host, serde_json::json!({ "type": "create_room", "data": {} })).await;
        let created = next_of_kind(&mut host, "room_joined").await;
        assert_eq!(created["data"]["is_host"], true);
        let room_id = created["room_id"].as_str().unwrap().to_string();

        send(
            &mut viewer,
            serde_json::json!({ "type": "join_room", "data": { "room_id": room_id } }),
        )
        .await;
        let joined = next_of_kind(&mut viewer, "room_joined").await;
        assert_eq!(joined["data"]["is_host"], false);

        send(
            &mut host,
            serde_json::json!({
                "type": "video_sync",
                "data": { "action": "play", "current_time": 120.0, "timestamp": 1 },
                "room_id": room_id,
            }),
        )
        .await;
        let relayed = next_of_kind(&mut viewer, "video_sync").await;
        assert_eq!(relayed["room_id"], room_id.as_str());
        assert_eq!(relayed["data"]["action"], "play");
        assert_eq!(relayed["data"]["current_time"], 120.0);

        send(
            &mut viewer,
            serde_json::json!({
                "type": "video_sync",
                "data": { "action": "pause", "current_time": 3.0, "timestamp": 2 },
                "room_id": room_id,
            }),
        )
        .await;
        let error = next_of_kind(&mut viewer, "error").await;
        assert_eq!(error["data"]["message"], "Only the host may control playback");
    }

    #[tokio::test]
    async fn host_disconnect_promotes_viewer() {
        let url = spawn_server().await;
        let (mut host, _) = connect_async(&url).await.unwrap();
        let (mut viewer, _) = connect_async(&url).await.unwrap();

        send(&mut host, serde_json::json!({ "type": "create_room" })).await;
        let room_id = next_of_kind(&mut host, "room_joined").await["room_id"]
            .as_str()
            .unwrap()
            .to_string();
        send(
            &mut viewer,
            serde_json::json!({ "type": "join_room", "data": { "room_id": room_id } }),
        )
        .await;
        let joined = next_of_kind(&mut viewer, "room_joined").await;
        let viewer_id = joined["data"]["client_id"].clone();

        host.close(None).await.unwrap();
        let changed = next_of_kind(&mut viewer, "host_changed").await;
        assert_eq!(changed["data"]["host_id"], viewer_id);
    }
}
