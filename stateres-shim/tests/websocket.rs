// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use stateres_core::test_utils::{EventBuilder, TEST_ROOM_ID};
use stateres_core::{EventId, StateKey};
use stateres_shim::message::{GetEventRequest, ResolveStateResponse};
use stateres_shim::test_utils::setup_logging;
use stateres_shim::{Config, MessageKind, Server, WireMessage};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

async fn start(config: Config) -> (SocketAddr, CancellationToken) {
    setup_logging();

    let server = Server::bind(config.bind_addr("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    client
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::text(message.to_string()))
        .await
        .unwrap();
}

async fn receive(client: &mut Client) -> WireMessage {
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => return WireMessage::decode(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended unexpectedly: {other:?}"),
        }
    }
}

/// Play the remote: serve event requests from `events` until the response to `id` arrives.
///
/// Returns the response and the requested event ids in order.
async fn serve_until_response(
    client: &mut Client,
    id: &str,
    events: &HashMap<&str, Value>,
) -> (ResolveStateResponse, Vec<String>) {
    let mut requested = Vec::new();
    loop {
        let message = receive(client).await;
        match message.kind {
            MessageKind::GetEvent => {
                let GetEventRequest { event_id } = message.data().unwrap();
                requested.push(event_id.to_string());
                if let Some(event) = events.get(event_id.as_str()) {
                    send(
                        client,
                        json!({
                            "id": message.id,
                            "type": "get_event",
                            "data": { "event": event },
                        }),
                    )
                    .await;
                }
            }
            MessageKind::ResolveState => {
                assert_eq!(message.id, id);
                return (message.data().unwrap(), requested);
            }
            MessageKind::Unknown => panic!("unexpected message {message:?}"),
        }
    }
}

fn create_key() -> String {
    StateKey::new("m.room.create", "").to_wire()
}

fn create_event(sender: &str, ts: u64) -> Value {
    EventBuilder::new("m.room.create", sender)
        .state_key("")
        .content(json!({ "creator": sender, "room_version": "10" }))
        .origin_server_ts(ts)
        .json()
}

fn resolve_state(id: &str, state: Value, event: Value) -> Value {
    json!({
        "id": id,
        "type": "resolve_state",
        "data": {
            "room_id": TEST_ROOM_ID,
            "room_version": "10",
            "state": state,
            "event": event,
        },
    })
}

#[tokio::test]
async fn get_event_response_completes_pending_fetch() {
    let (addr, shutdown) = start(Config::default()).await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        resolve_state("r1", json!([{ (create_key()): "A" }, {}]), Value::Null),
    )
    .await;

    // The shim asks for the event it is missing.
    let request = receive(&mut client).await;
    assert_eq!(request.kind, MessageKind::GetEvent);
    assert_eq!(request.data, json!({ "event_id": "A" }));

    // Answer with the event, including the `event_id` field the wire format shouldn't carry.
    let mut event = create_event(ALICE, 0);
    event["event_id"] = json!("A");
    send(
        &mut client,
        json!({ "id": request.id, "type": "get_event", "data": { "event": event } }),
    )
    .await;

    let (response, requested) = serve_until_response(&mut client, "r1", &HashMap::new()).await;
    assert_eq!(response.error, "");
    assert_eq!(
        response.result[&StateKey::new("m.room.create", "")],
        EventId::from("A")
    );
    assert!(requested.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn resolves_conflicting_state_sets() {
    let (addr, shutdown) = start(Config::default()).await;
    let mut client = connect(addr).await;
    let mut events = HashMap::new();
    events.insert("E1", create_event(ALICE, 1));
    events.insert("E2", create_event(BOB, 2));

    send(
        &mut client,
        resolve_state(
            "r2",
            json!([{ (create_key()): "E1" }, { (create_key()): "E2" }]),
            Value::Null,
        ),
    )
    .await;

    let (response, mut requested) = serve_until_response(&mut client, "r2", &events).await;
    assert_eq!(response.error, "");
    assert_eq!(
        response.result[&StateKey::new("m.room.create", "")],
        EventId::from("E2")
    );

    // Every event crossed the connection once.
    requested.sort();
    assert_eq!(requested, ["E1", "E2"]);

    shutdown.cancel();
}

#[tokio::test]
async fn failed_auth_of_proposed_event_is_reported() {
    let (addr, shutdown) = start(Config::default()).await;
    let mut client = connect(addr).await;
    let mut events = HashMap::new();
    events.insert("E1", create_event(ALICE, 1));
    events.insert("E2", create_event(BOB, 2));

    // A state event without any auth events fails the independent checks.
    let proposed = EventBuilder::new("m.room.topic", ALICE)
        .state_key("")
        .content(json!({ "topic": "hello" }))
        .json();
    send(
        &mut client,
        resolve_state(
            "r3",
            json!([{ (create_key()): "E1" }, { (create_key()): "E2" }]),
            proposed,
        ),
    )
    .await;

    let (response, _) = serve_until_response(&mut client, "r3", &events).await;
    assert!(!response.error.is_empty());
    let create = StateKey::new("m.room.create", "");
    let topic = StateKey::new("m.room.topic", "");
    assert!(response.result.contains_key(&create));
    assert!(!response.result.contains_key(&topic));

    shutdown.cancel();
}

#[tokio::test]
async fn unanswered_fetches_time_out() {
    let config = Config::default().fetch_timeout(Duration::from_millis(200));
    let (addr, shutdown) = start(config).await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        resolve_state(
            "r4",
            json!([{ (create_key()): "unknown" }, {}]),
            Value::Null,
        ),
    )
    .await;

    // Never answer the request for the unknown event.
    let (response, requested) = serve_until_response(&mut client, "r4", &HashMap::new()).await;
    assert_eq!(requested, ["unknown"]);
    assert!(response.error.contains("fetch timeout"));
    assert!(response.result.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn malformed_messages_keep_the_connection_open() {
    let (addr, shutdown) = start(Config::default()).await;
    let mut client = connect(addr).await;

    client
        .send(Message::text("not json".to_string()))
        .await
        .unwrap();
    send(
        &mut client,
        json!({ "id": "x", "type": "resolve_state", "data": {} }),
    )
    .await;
    send(
        &mut client,
        json!({ "id": "y", "type": "get_event", "data": { "event": {} } }),
    )
    .await;
    send(
        &mut client,
        json!({ "id": "z", "type": "subscribe", "data": {} }),
    )
    .await;

    // Only the well-formed request gets a response.
    send(&mut client, resolve_state("r5", json!([]), Value::Null)).await;
    let (response, requested) = serve_until_response(&mut client, "r5", &HashMap::new()).await;
    assert!(response.result.is_empty());
    assert_eq!(response.error, "");
    assert!(requested.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn sessions_do_not_share_events() {
    let (addr, shutdown) = start(Config::default()).await;
    let mut events = HashMap::new();
    events.insert("E1", create_event(ALICE, 1));
    events.insert("E2", create_event(BOB, 2));

    for id in ["first", "second"] {
        let mut client = connect(addr).await;
        send(
            &mut client,
            resolve_state(
                id,
                json!([{ (create_key()): "E1" }, { (create_key()): "E2" }]),
                Value::Null,
            ),
        )
        .await;

        // A new connection starts with an empty cache.
        let (_, mut requested) = serve_until_response(&mut client, id, &events).await;
        requested.sort();
        assert_eq!(requested, ["E1", "E2"]);
        client.close(None).await.ok();
    }

    shutdown.cancel();
}
