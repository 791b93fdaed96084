//! Live-channel tests against a real listener.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use board_core::SqliteStore;
use board_protocol::{codec, ClientFrame, ServerEvent};
use board_server::{app, AppState, Config};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    spawn_server_with(Config::default()).await
}

async fn spawn_server_with(config: Config) -> (SocketAddr, Arc<AppState>) {
    let store = SqliteStore::open_in_memory().unwrap();
    let state = Arc::new(AppState::new(config, Arc::new(store)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, state)
}

async fn connect(addr: SocketAddr, query: &str, state: &AppState) -> Client {
    let before = state.board.broadcaster().subscriber_count();
    let (client, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();

    // The upgrade completes before the server registers the subscriber
    tokio::time::timeout(WAIT, async {
        while state.board.broadcaster().subscriber_count() <= before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber never registered");

    client
}

async fn next_event(client: &mut Client) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return codec::from_json(&text).unwrap(),
            Message::Binary(data) => return codec::decode(&data).unwrap(),
            _ => continue,
        }
    }
}

async fn post(client: &mut Client, text: &str) {
    let frame = codec::to_json(&ClientFrame::send_message(text)).unwrap();
    client.send(Message::Text(frame)).await.unwrap();
}

async fn http_delete(state: &Arc<AppState>, id: i64) -> StatusCode {
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/messages/{id}"))
        .body(Body::empty())
        .unwrap();
    app(Arc::clone(state)).oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_post_reaches_every_client_including_sender() {
    let (addr, state) = spawn_server().await;
    let mut alice = connect(addr, "", &state).await;
    let mut bob = connect(addr, "", &state).await;

    post(&mut alice, "  hello  ").await;

    let seen_by_alice = next_event(&mut alice).await;
    let seen_by_bob = next_event(&mut bob).await;
    assert_eq!(seen_by_alice, seen_by_bob);

    match seen_by_alice {
        ServerEvent::NewMessage(msg) => {
            assert_eq!(msg.id, 1);
            assert_eq!(msg.text, "hello");
            assert_eq!(state.board.history().await.unwrap(), vec![msg]);
        }
        other => panic!("Expected new_message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_blank_and_garbage_frames_are_ignored() {
    let (addr, state) = spawn_server().await;
    let mut alice = connect(addr, "", &state).await;

    post(&mut alice, "   ").await;
    alice.send(Message::Text("not json".into())).await.unwrap();
    alice
        .send(Message::Text(r#"{"event":"edit_message","data":{"id":1}}"#.into()))
        .await
        .unwrap();

    // The connection survives; the next real post is the first event seen
    post(&mut alice, "real").await;
    match next_event(&mut alice).await {
        ServerEvent::NewMessage(msg) => assert_eq!((msg.id, msg.text.as_str()), (1, "real")),
        other => panic!("Expected new_message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_post_post_delete_order() {
    let (addr, state) = spawn_server().await;
    let mut alice = connect(addr, "", &state).await;
    let mut bob = connect(addr, "", &state).await;

    post(&mut alice, "a").await;
    assert_eq!(next_event(&mut alice).await.message_id(), 1);
    post(&mut bob, "b").await;
    assert_eq!(next_event(&mut alice).await.message_id(), 2);
    assert_eq!(http_delete(&state, 1).await, StatusCode::NO_CONTENT);
    assert_eq!(next_event(&mut alice).await, ServerEvent::delete_message(1));

    let mut bob_saw = Vec::new();
    for _ in 0..3 {
        let event = next_event(&mut bob).await;
        bob_saw.push((event.name(), event.message_id()));
    }
    assert_eq!(
        bob_saw,
        vec![("new_message", 1), ("new_message", 2), ("delete_message", 1)]
    );

    let history = state.board.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!((history[0].id, history[0].text.as_str()), (2, "b"));
}

#[tokio::test]
async fn test_msgpack_clients_share_the_stream() {
    let (addr, state) = spawn_server().await;
    let mut binary = connect(addr, "?format=msgpack", &state).await;
    let mut text = connect(addr, "", &state).await;

    let frame = codec::encode(&ClientFrame::send_message("packed")).unwrap();
    binary.send(Message::Binary(frame.to_vec())).await.unwrap();

    let raw = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Binary(data))) = binary.next().await {
                return data;
            }
        }
    })
    .await
    .unwrap();
    let via_msgpack: ServerEvent = codec::decode(&raw).unwrap();
    let via_json = next_event(&mut text).await;

    assert_eq!(via_msgpack, via_json);
    assert_eq!(via_json.name(), "new_message");
}

#[tokio::test]
async fn test_disconnect_unsubscribes() {
    let (addr, state) = spawn_server().await;
    let mut alice = connect(addr, "", &state).await;
    assert_eq!(state.board.broadcaster().subscriber_count(), 1);

    alice.close(None).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while state.board.broadcaster().subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber never removed");

    // Publishing with nobody listening is still fine
    assert_eq!(http_delete(&state, 1).await, StatusCode::NO_CONTENT);
}

async fn wait_for_subscribers(state: &AppState, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while state.board.broadcaster().subscriber_count() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

#[tokio::test]
async fn test_connection_cap_refuses_with_503() {
    let mut config = Config::default();
    config.limits.max_connections = 1;
    let (addr, state) = spawn_server_with(config).await;

    let mut first = connect(addr, "", &state).await;

    match connect_async(format!("ws://{addr}/ws")).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
        }
        Ok(_) => panic!("Second connection should have been refused"),
        Err(other) => panic!("Expected an HTTP refusal, got {:?}", other),
    }
    assert_eq!(state.board.broadcaster().subscriber_count(), 1);

    // The slot frees up once the first client leaves
    first.close(None).await.unwrap();
    wait_for_subscribers(&state, 0).await;
    let _second = connect(addr, "", &state).await;
}

#[tokio::test]
async fn test_silent_connection_is_dropped_by_heartbeat() {
    let mut config = Config::default();
    config.heartbeat.interval_ms = 50;
    config.heartbeat.timeout_ms = 120;
    let (addr, state) = spawn_server_with(config).await;

    // Never polled, so the server's pings go unanswered
    let _silent = connect(addr, "", &state).await;
    assert_eq!(state.board.broadcaster().subscriber_count(), 1);

    wait_for_subscribers(&state, 0).await;
}
