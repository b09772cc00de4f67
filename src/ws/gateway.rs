use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    ActivityMessage, AuthAck, CursorMessage, ErrorMessage, FileMessage, JoinMessage, LeaveMessage,
    PresenceStatus, ProtocolError, ReceivedMessage, RoomMessage, SendMessage, StatusMessage,
};
use crate::services::auth_service::Identity;
use crate::ws::session::{RoomBinding, Session};
use crate::AppState;

/// Sent when the connection never produced a valid token.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Sent when a client read messages slower than its rooms produced them.
pub const CLOSE_SLOW_CONSUMER: u16 = 4408;

type SocketSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Credentials carried on the upgrade request itself, as an alternative to
/// a first `auth` message.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub user_id: Option<String>,
}

/// WebSocket handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    info!("New WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, params))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, params: ConnectParams) {
    // Every connection gets its own session id, used to skip broadcast
    // echoes and to key presence records.
    let session_id = Uuid::new_v4();
    info!("WebSocket connection established with session_id: {}", session_id);

    // Split the socket into sender and receiver. Replies and the per-room
    // forwarder tasks share the sender, so wrap it in an Arc and Mutex.
    let (sender, mut receiver) = socket.split();
    let sender: SocketSender = Arc::new(Mutex::new(sender));

    // Until a token checks out, auth is the only message the connection
    // may send.
    let identity = match authenticate(&mut receiver, &sender, &app_state, session_id, params).await {
        Some(identity) => identity,
        None => {
            info!("WebSocket connection terminated for session_id: {}", session_id);
            return;
        }
    };

    let mut session = Session::new(session_id, identity.user_id);
    let cancel = CancellationToken::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // A forwarder fell behind its room broadcast, which means
                // frames were already lost. The client has to reconnect and
                // re-bootstrap.
                send_close(&sender, CLOSE_SLOW_CONSUMER, "message backlog overflowed").await;
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&text, &mut session, &sender, &cancel, &app_state).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping and Pong are answered at the protocol level; binary
                // frames carry nothing in this protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive error for session {}: {}", session_id, e);
                    break;
                }
            }
        }
    }

    teardown(&mut session, &app_state).await;
    info!(
        "WebSocket connection terminated for session_id: {} after {}s",
        session_id,
        (chrono::Utc::now() - session.connected_at).num_seconds()
    );
}

/// Runs the pre-auth phase: reads frames until a valid auth message shows up
/// or the window expires. Anything else gets an error reply and is dropped.
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    sender: &SocketSender,
    app_state: &Arc<AppState>,
    session_id: Uuid,
    params: ConnectParams,
) -> Option<Identity> {
    // A token on the upgrade query skips the auth message round-trip.
    if let Some(token) = params.token {
        return verify_token(sender, app_state, session_id, &token, params.user_id.as_deref())
            .await;
    }

    let deadline = tokio::time::sleep(app_state.config.auth_timeout());
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            _ = &mut deadline => {
                warn!(
                    "Session {} did not authenticate within {}s, closing",
                    session_id,
                    app_state.config.auth_timeout_secs
                );
                send_close(sender, CLOSE_UNAUTHORIZED, "authentication timeout").await;
                return None;
            }
            frame = receiver.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket receive error for session {}: {}", session_id, e);
                return None;
            }
        };

        let auth = match ReceivedMessage::parse(&text) {
            Ok(ReceivedMessage::Auth(auth)) => auth,
            Ok(other) => {
                warn!(
                    "Session {} sent '{}' before authenticating",
                    session_id,
                    other.type_name()
                );
                send_error(sender, 401, "authenticate first").await;
                continue;
            }
            Err(e) => {
                log_protocol_error(session_id, &e);
                continue;
            }
        };

        return verify_token(sender, app_state, session_id, &auth.token, auth.user_id.as_deref())
            .await;
    }
}

/// Verify one token, ack the result and close the connection if it did not
/// check out. Shared by the query-param and auth-message paths.
async fn verify_token(
    sender: &SocketSender,
    app_state: &Arc<AppState>,
    session_id: Uuid,
    token: &str,
    claimed_user: Option<&str>,
) -> Option<Identity> {
    match app_state.verifier.verify(token).await {
        Ok(identity) => {
            if let Some(claimed) = claimed_user {
                if claimed != identity.user_id {
                    debug!(
                        "Session {} claimed user {} but token subject is {}",
                        session_id, claimed, identity.user_id
                    );
                }
            }
            info!("Session {} authenticated as user: {}", session_id, identity.user_id);
            send_message(
                sender,
                &SendMessage::Auth(AuthAck {
                    success: true,
                    user_id: Some(identity.user_id.clone()),
                    error: None,
                }),
            )
            .await;
            Some(identity)
        }
        Err(e) => {
            warn!("Session {} failed authentication: {}", session_id, e);
            send_message(
                sender,
                &SendMessage::Auth(AuthAck {
                    success: false,
                    user_id: None,
                    error: Some(e.to_string()),
                }),
            )
            .await;
            send_close(sender, CLOSE_UNAUTHORIZED, "authentication failed").await;
            None
        }
    }
}

async fn handle_frame(
    text: &str,
    session: &mut Session,
    sender: &SocketSender,
    cancel: &CancellationToken,
    app_state: &Arc<AppState>,
) {
    let message = match ReceivedMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            log_protocol_error(session.session_id, &e);
            return;
        }
    };

    match message {
        ReceivedMessage::Auth(_) => {
            debug!("Session {} re-sent auth after authenticating", session.session_id);
        }
        ReceivedMessage::Join(join) => {
            handle_join(join, session, sender, cancel, app_state).await;
        }
        ReceivedMessage::Leave(leave) => {
            handle_leave(leave, session, sender, app_state).await;
        }
        ReceivedMessage::Cursor(cursor) => {
            handle_cursor(cursor, session, sender).await;
        }
        ReceivedMessage::File(file) => {
            handle_file(file, session, sender).await;
        }
        ReceivedMessage::Activity(activity) => {
            handle_activity(activity, session, sender, app_state).await;
        }
        ReceivedMessage::Status(status) => {
            handle_status(status, session, sender, app_state).await;
        }
        ReceivedMessage::Heartbeat(_) => {
            app_state.presence.heartbeat(session.session_id).await;
        }
    }
}

async fn handle_join(
    join: JoinMessage,
    session: &mut Session,
    sender: &SocketSender,
    cancel: &CancellationToken,
    app_state: &Arc<AppState>,
) {
    // A repeated join acts as a resync: the old subscription is torn down
    // and the client gets a fresh bootstrap.
    if let Some(stale) = session.unbind_room(&join.project_id) {
        stale.forwarder.abort();
    }

    // A room resolved here can be retired by eviction before the join lands;
    // retirement and registry removal happen together, so re-resolving always
    // produces a live room.
    let (room, joined, rx, collaborator) = loop {
        let room = match app_state.registry.get_or_create(&join.project_id).await {
            Ok(room) => room,
            Err(e) => {
                error!("Failed to open room for project {}: {}", join.project_id, e);
                send_error(sender, 500, &format!("failed to load project {}", join.project_id))
                    .await;
                return;
            }
        };
        if let Some((joined, rx, collaborator)) =
            room.join(session.session_id, &session.user_id).await
        {
            break (room, joined, rx, collaborator);
        }
        debug!("Room {} retired before join, resolving a fresh one", join.project_id);
    };

    // Bootstrap first, stream after. The receiver buffers anything broadcast
    // in between.
    send_message(sender, &SendMessage::Joined(joined)).await;

    let forwarder = spawn_forwarder(
        join.project_id.clone(),
        rx,
        sender.clone(),
        session.session_id,
        cancel.clone(),
    );
    session.bind_room(join.project_id, RoomBinding { room, forwarder });

    if let Some(notifier) = &app_state.notifier {
        notifier.notify_presence_bg("join", collaborator);
    }
}

async fn handle_leave(
    leave: LeaveMessage,
    session: &mut Session,
    sender: &SocketSender,
    app_state: &Arc<AppState>,
) {
    let Some(binding) = session.unbind_room(&leave.project_id) else {
        send_error(sender, 403, &format!("not joined to project {}", leave.project_id)).await;
        return;
    };
    binding.forwarder.abort();

    let collaborator = app_state
        .presence
        .collaborator(&leave.project_id, session.session_id)
        .await;
    let empty = binding.room.leave(session.session_id, &session.user_id).await;
    if empty {
        app_state.registry.schedule_eviction(leave.project_id);
    }

    if let (Some(notifier), Some(collaborator)) = (&app_state.notifier, collaborator) {
        notifier.notify_presence_bg("leave", collaborator);
    }
}

async fn handle_cursor(cursor: CursorMessage, session: &mut Session, sender: &SocketSender) {
    let Some(room) = session.room(&cursor.project_id) else {
        send_error(sender, 403, &format!("not joined to project {}", cursor.project_id)).await;
        return;
    };
    room.apply_cursor(session.session_id, &session.user_id, &cursor).await;
}

async fn handle_file(file: FileMessage, session: &mut Session, sender: &SocketSender) {
    let Some(room) = session.room(&file.project_id) else {
        send_error(sender, 403, &format!("not joined to project {}", file.project_id)).await;
        return;
    };
    room.apply_file(session.session_id, &session.user_id, &file).await;
}

async fn handle_activity(
    activity: ActivityMessage,
    session: &mut Session,
    sender: &SocketSender,
    app_state: &Arc<AppState>,
) {
    let Some(room) = session.room(&activity.project_id) else {
        send_error(sender, 403, &format!("not joined to project {}", activity.project_id)).await;
        return;
    };
    let record = room
        .record_activity(session.session_id, &session.user_id, &activity)
        .await;

    if let Some(notifier) = &app_state.notifier {
        notifier.notify_activity_bg(activity.project_id, record);
    }
}

async fn handle_status(
    status: StatusMessage,
    session: &mut Session,
    sender: &SocketSender,
    app_state: &Arc<AppState>,
) {
    // Offline is what disconnects produce, not something a client declares.
    if status.status == PresenceStatus::Offline {
        send_error(sender, 400, "status must be online or away").await;
        return;
    }

    let updated = app_state
        .presence
        .update_status(
            session.session_id,
            status.status,
            status.project_id.as_deref(),
            status.current_page.clone(),
        )
        .await;

    for collaborator in updated {
        let project_id = collaborator.project_id.clone();
        if let Some(room) = session.room(&project_id) {
            room.broadcast_presence_update(session.session_id, collaborator).await;
        }
    }
}

/// Spawns the task that copies one room's broadcasts onto the socket,
/// skipping this session's own messages. Falling behind the channel is
/// terminal for the connection.
fn spawn_forwarder(
    project_id: String,
    mut rx: broadcast::Receiver<RoomMessage>,
    sender: SocketSender,
    session_id: Uuid,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(room_message) => {
                    if room_message.sender_id == session_id {
                        continue;
                    }
                    let text = match serde_json::to_string(&room_message.message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to serialize broadcast for project {}: {}", project_id, e);
                            continue;
                        }
                    };
                    if sender.lock().await.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Session {} lagged {} message(s) behind project {}, dropping connection",
                        session_id, skipped, project_id
                    );
                    cancel.cancel();
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Disconnect cleanup, run exactly once per connection: leave every joined
/// room and let the registry know about rooms that emptied out.
async fn teardown(session: &mut Session, app_state: &Arc<AppState>) {
    for (project_id, binding) in session.take_rooms() {
        binding.forwarder.abort();

        let collaborator = app_state
            .presence
            .collaborator(&project_id, session.session_id)
            .await;
        let empty = binding.room.leave(session.session_id, &session.user_id).await;
        if empty {
            app_state.registry.schedule_eviction(project_id);
        }

        if let (Some(notifier), Some(collaborator)) = (&app_state.notifier, collaborator) {
            notifier.notify_presence_bg("leave", collaborator);
        }
    }
}

async fn send_message(sender: &SocketSender, message: &SendMessage) {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize outbound message: {}", e);
            return;
        }
    };
    if let Err(e) = sender.lock().await.send(Message::Text(text)).await {
        debug!("Failed to send message over WebSocket: {}", e);
    }
}

async fn send_error(sender: &SocketSender, code: u16, message: &str) {
    send_message(
        sender,
        &SendMessage::Error(ErrorMessage {
            code,
            message: message.to_string(),
        }),
    )
    .await;
}

async fn send_close(sender: &SocketSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = sender.lock().await.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

fn log_protocol_error(session_id: Uuid, error: &ProtocolError) {
    match error {
        ProtocolError::Malformed(e) => {
            debug!("Session {} sent an unparseable frame: {}", session_id, e);
        }
        ProtocolError::UnknownType(type_) => {
            warn!("Session {} sent unknown message type '{}'", session_id, type_);
        }
        ProtocolError::BadPayload { .. } => {
            warn!("Session {}: {}", session_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::routing::get;
    use axum::Router;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use crate::config::Config;
    use crate::db::{MemorySnapshotStore, SnapshotStore};
    use crate::presence::PresenceStore;
    use crate::room::RoomRegistry;
    use crate::services::auth_service::{IdentityVerifier, JwtVerifier};

    const SECRET: &str = "gateway-test-secret";

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn mint(sub: &str) -> String {
        let claims = json!({
            "sub": sub,
            "exp": chrono::Utc::now().timestamp() + 600,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.cloud_auth_jwt_secret = Some(SECRET.to_string());
        config.auth_timeout_secs = 1;
        config
    }

    async fn start_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let presence = Arc::new(PresenceStore::new(
            config.offline_threshold(),
            config.away_threshold(),
            config.presence_retention(),
        ));
        let registry = Arc::new(RoomRegistry::new(
            config.clone(),
            store.clone(),
            presence.clone(),
        ));
        let verifier: Arc<dyn IdentityVerifier> =
            Arc::new(JwtVerifier::new(config.cloud_auth_jwt_secret.clone()));
        let state = Arc::new(AppState {
            config,
            registry,
            presence,
            verifier,
            store,
            notifier: None,
        });

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        client
    }

    async fn send_json(client: &mut Client, value: Value) {
        client
            .send(tungstenite::Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn recv_json(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            match frame {
                tungstenite::Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).unwrap()
                }
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn recv_close_code(client: &mut Client) -> u16 {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for close")
                .expect("stream ended")
                .unwrap();
            match frame {
                tungstenite::Message::Close(Some(frame)) => return u16::from(frame.code),
                tungstenite::Message::Close(None) => panic!("close frame without a code"),
                _ => continue,
            }
        }
    }

    async fn authed_client(addr: SocketAddr, user: &str) -> Client {
        let mut client = connect(addr).await;
        send_json(&mut client, json!({"type": "auth", "data": {"token": mint(user)}})).await;
        let ack = recv_json(&mut client).await;
        assert_eq!(ack["type"], "auth");
        assert_eq!(ack["data"]["success"], true);
        assert_eq!(ack["data"]["userId"], user);
        client
    }

    async fn joined_client(addr: SocketAddr, user: &str, project: &str) -> (Client, Value) {
        let mut client = authed_client(addr, user).await;
        send_json(&mut client, json!({"type": "join", "data": {"projectId": project}})).await;
        let joined = recv_json(&mut client).await;
        assert_eq!(joined["type"], "joined");
        assert_eq!(joined["data"]["projectId"], project);
        (client, joined)
    }

    #[tokio::test]
    async fn join_bootstrap_reflects_prior_session_work() {
        let (addr, _state) = start_server(test_config()).await;

        let (mut alice, _) = joined_client(addr, "alice", "p1").await;
        send_json(
            &mut alice,
            json!({"type": "file", "data": {
                "projectId": "p1", "action": "create",
                "path": "main.rs", "content": "fn main() {}",
            }}),
        )
        .await;
        send_json(
            &mut alice,
            json!({"type": "activity", "data": {
                "projectId": "p1", "action": "compile", "filePath": "main.rs",
            }}),
        )
        .await;

        // A repeated join doubles as a resync and proves the writes above
        // were applied before bob comes in.
        send_json(&mut alice, json!({"type": "join", "data": {"projectId": "p1"}})).await;
        let resync = recv_json(&mut alice).await;
        assert_eq!(resync["type"], "joined");
        assert_eq!(resync["data"]["files"]["main.rs"], "fn main() {}");

        // Bob joins after the fact and gets the accumulated state.
        let (_bob, joined) = joined_client(addr, "bob", "p1").await;
        assert_eq!(joined["data"]["files"]["main.rs"], "fn main() {}");
        assert_eq!(joined["data"]["activity"][0]["action"], "file.create");
        assert_eq!(joined["data"]["activity"][1]["action"], "compile");
        // The collaborator list bootstraps the peers already present; bob's
        // own record is not in it.
        let users: Vec<&str> = joined["data"]["collaborators"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["userId"].as_str().unwrap())
            .collect();
        assert!(users.contains(&"alice") && !users.contains(&"bob"));

        // Alice hears about bob coming in.
        let event = recv_json(&mut alice).await;
        assert_eq!(event["type"], "presence-join");
        assert_eq!(event["data"]["collaborator"]["userId"], "bob");
    }

    #[tokio::test]
    async fn broadcasts_reach_peers_but_never_echo() {
        let (addr, _state) = start_server(test_config()).await;

        let (mut alice, _) = joined_client(addr, "alice", "p1").await;
        let (mut bob, _) = joined_client(addr, "bob", "p1").await;
        let event = recv_json(&mut alice).await;
        assert_eq!(event["type"], "presence-join");

        send_json(
            &mut alice,
            json!({"type": "file", "data": {
                "projectId": "p1", "action": "create", "path": "a.txt", "content": "1",
            }}),
        )
        .await;
        let event = recv_json(&mut bob).await;
        assert_eq!(event["type"], "file-change");
        assert_eq!(event["data"]["path"], "a.txt");
        assert_eq!(event["data"]["userId"], "alice");

        // If alice's own change had been echoed back, it would arrive before
        // bob's cursor move does.
        send_json(
            &mut bob,
            json!({"type": "cursor", "data": {
                "projectId": "p1", "position": {"line": 1, "column": 2},
            }}),
        )
        .await;
        let event = recv_json(&mut alice).await;
        assert_eq!(event["type"], "cursor-move");
        assert_eq!(event["data"]["cursor"]["userId"], "bob");
    }

    #[tokio::test]
    async fn rejects_messages_before_auth_and_closes_on_bad_token() {
        let (addr, _state) = start_server(test_config()).await;
        let mut client = connect(addr).await;

        send_json(&mut client, json!({"type": "join", "data": {"projectId": "p1"}})).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["code"], 401);

        send_json(&mut client, json!({"type": "auth", "data": {"token": "not-a-jwt"}})).await;
        let ack = recv_json(&mut client).await;
        assert_eq!(ack["type"], "auth");
        assert_eq!(ack["data"]["success"], false);
        assert_eq!(recv_close_code(&mut client).await, CLOSE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn query_param_token_authenticates_without_an_auth_message() {
        let (addr, _state) = start_server(test_config()).await;

        let url = format!("ws://{}/ws?token={}&user_id=alice", addr, mint("alice"));
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let ack = recv_json(&mut client).await;
        assert_eq!(ack["type"], "auth");
        assert_eq!(ack["data"]["success"], true);
        assert_eq!(ack["data"]["userId"], "alice");

        send_json(&mut client, json!({"type": "join", "data": {"projectId": "p1"}})).await;
        assert_eq!(recv_json(&mut client).await["type"], "joined");

        // A bad query token is rejected the same way a bad auth message is.
        let url = format!("ws://{}/ws?token=not-a-jwt", addr);
        let (mut rejected, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let ack = recv_json(&mut rejected).await;
        assert_eq!(ack["data"]["success"], false);
        assert_eq!(recv_close_code(&mut rejected).await, CLOSE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_window_expiry_closes_the_connection() {
        let (addr, _state) = start_server(test_config()).await;
        let mut client = connect(addr).await;
        assert_eq!(recv_close_code(&mut client).await, CLOSE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mutations_require_a_prior_join() {
        let (addr, _state) = start_server(test_config()).await;
        let mut client = authed_client(addr, "alice").await;

        send_json(
            &mut client,
            json!({"type": "cursor", "data": {
                "projectId": "p1", "position": {"line": 0, "column": 0},
            }}),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["code"], 403);

        // The same applies after an explicit leave.
        send_json(&mut client, json!({"type": "join", "data": {"projectId": "p1"}})).await;
        assert_eq!(recv_json(&mut client).await["type"], "joined");
        send_json(&mut client, json!({"type": "leave", "data": {"projectId": "p1"}})).await;
        send_json(
            &mut client,
            json!({"type": "file", "data": {
                "projectId": "p1", "action": "create", "path": "a.txt", "content": "1",
            }}),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["code"], 403);
    }

    #[tokio::test]
    async fn disconnect_broadcasts_leave_and_clears_presence() {
        let (addr, state) = start_server(test_config()).await;

        let (alice, _) = joined_client(addr, "alice", "p1").await;
        let (mut bob, _) = joined_client(addr, "bob", "p1").await;
        drop(alice);

        let event = recv_json(&mut bob).await;
        assert_eq!(event["type"], "presence-leave");
        assert_eq!(event["data"]["userId"], "alice");

        let collaborators = state.presence.list_collaborators("p1").await;
        assert_eq!(collaborators.len(), 1);
        assert_eq!(collaborators[0].user_id, "bob");
    }

    #[tokio::test]
    async fn status_changes_fan_out_as_presence_updates() {
        let (addr, _state) = start_server(test_config()).await;

        let (mut alice, _) = joined_client(addr, "alice", "p1").await;
        let (mut bob, _) = joined_client(addr, "bob", "p1").await;
        assert_eq!(recv_json(&mut alice).await["type"], "presence-join");

        send_json(
            &mut bob,
            json!({"type": "status", "data": {"status": "away", "currentPage": "src/main.rs"}}),
        )
        .await;
        let event = recv_json(&mut alice).await;
        assert_eq!(event["type"], "presence-update");
        assert_eq!(event["data"]["collaborator"]["status"], "away");
        assert_eq!(event["data"]["collaborator"]["currentPage"], "src/main.rs");

        // Clients cannot declare themselves offline.
        send_json(&mut bob, json!({"type": "status", "data": {"status": "offline"}})).await;
        let reply = recv_json(&mut bob).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["code"], 400);
    }
}
