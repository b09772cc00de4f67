//! End-to-end collaboration tests over a real listener.
//!
//! Each test starts the full router on an ephemeral port and drives it with
//! tokio-tungstenite clients, the same way a browser client would: auth,
//! join, mutate, observe broadcasts and the REST collaborator listing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use colabri_sync::config::Config;
use colabri_sync::db::{MemorySnapshotStore, SnapshotStore};
use colabri_sync::presence::PresenceStore;
use colabri_sync::room::RoomRegistry;
use colabri_sync::services::auth_service::{IdentityVerifier, JwtVerifier};
use colabri_sync::{app_router, AppState};

const SECRET: &str = "ws-collaboration-secret";

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
    config.auth_timeout_secs = 2;
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

    let app = app_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
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

/// Reads frames until one of the wanted type shows up, discarding the
/// presence chatter other clients generate in the meantime.
async fn recv_until(client: &mut Client, wanted: &str) -> Value {
    for _ in 0..16 {
        let frame = recv_json(client).await;
        if frame["type"] == wanted {
            return frame;
        }
    }
    panic!("no '{wanted}' frame arrived");
}

async fn joined_client(addr: SocketAddr, user: &str, project: &str) -> (Client, Value) {
    let url = format!("ws://{}/ws?token={}", addr, mint(user));
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let ack = recv_json(&mut client).await;
    assert_eq!(ack["data"]["success"], true);

    send_json(&mut client, json!({"type": "join", "data": {"projectId": project}})).await;
    let joined = recv_json(&mut client).await;
    assert_eq!(joined["type"], "joined");
    (client, joined)
}

fn file_frame(project: &str, action: &str, path: &str, content: &str) -> Value {
    json!({"type": "file", "data": {
        "projectId": project, "action": action, "path": path, "content": content,
    }})
}

#[tokio::test]
async fn concurrent_disjoint_writes_converge_on_both_clients() {
    let (addr, _state) = start_server(test_config()).await;

    let (mut alice, _) = joined_client(addr, "alice", "p1").await;
    let (mut bob, _) = joined_client(addr, "bob", "p1").await;
    assert_eq!(recv_json(&mut alice).await["type"], "presence-join");

    // Both sides write different paths without waiting for each other.
    send_json(&mut alice, file_frame("p1", "create", "a.txt", "from alice")).await;
    send_json(&mut bob, file_frame("p1", "create", "b.txt", "from bob")).await;

    let to_alice = recv_json(&mut alice).await;
    assert_eq!(to_alice["type"], "file-change");
    assert_eq!(to_alice["data"]["path"], "b.txt");
    let to_bob = recv_json(&mut bob).await;
    assert_eq!(to_bob["type"], "file-change");
    assert_eq!(to_bob["data"]["path"], "a.txt");

    // A resync join shows the merged document: both paths, correct content.
    for client in [&mut alice, &mut bob] {
        send_json(client, json!({"type": "join", "data": {"projectId": "p1"}})).await;
        let resync = recv_until(client, "joined").await;
        assert_eq!(resync["data"]["files"]["a.txt"], "from alice");
        assert_eq!(resync["data"]["files"]["b.txt"], "from bob");
    }
}

#[tokio::test]
async fn updates_from_one_session_arrive_in_issue_order() {
    let (addr, _state) = start_server(test_config()).await;

    let (mut alice, _) = joined_client(addr, "alice", "p1").await;
    let (mut bob, _) = joined_client(addr, "bob", "p1").await;
    assert_eq!(recv_json(&mut alice).await["type"], "presence-join");

    for version in 0..5 {
        send_json(&mut alice, file_frame("p1", "update", "doc.md", &format!("v{version}"))).await;
    }

    // Each change also emits an activity broadcast; only the file-change
    // frames matter for ordering here.
    for version in 0..5 {
        let event = recv_until(&mut bob, "file-change").await;
        assert_eq!(event["data"]["content"], format!("v{version}"));
    }
}

#[tokio::test]
async fn lapsed_heartbeat_drops_collaborator_from_rest_listing() {
    let mut config = test_config();
    config.offline_threshold_secs = 1;
    let (addr, _state) = start_server(config).await;

    let (_alice, _) = joined_client(addr, "alice", "p1").await;
    let (mut bob, _) = joined_client(addr, "bob", "p1").await;

    // Alice goes silent without disconnecting; bob keeps heartbeating.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    send_json(&mut bob, json!({"type": "heartbeat"})).await;

    let http = reqwest::Client::new();
    let listed: Vec<Value> = http
        .get(format!("http://{}/api/v1/projects/p1/collaborators", addr))
        .bearer_auth(mint("bob"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let users: Vec<&str> = listed.iter().map(|c| c["userId"].as_str().unwrap()).collect();
    assert_eq!(users, vec!["bob"]);
}

#[tokio::test]
async fn rest_listing_requires_a_valid_token() {
    let (addr, _state) = start_server(test_config()).await;

    let http = reqwest::Client::new();
    let anonymous = http
        .get(format!("http://{}/api/v1/projects/p1/collaborators", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);

    let health = http
        .get(format!("http://{}/api/v1/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
}
