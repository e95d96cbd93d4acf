//! Client lifecycle and request/response integration tests

mod common;

use common::{is_join, response_to, wait_until, MockGameServer};
use segsync_client::{ClientBuilder, ConnectionState, NoReconnect, SyncEvent};
use segsync_core::{Error, RequestKind, LEGACY_EVENT_PUSH};
use serde_json::{json, Map, Value};
use std::time::Duration;

fn game_server_reply(request: &Value) -> Vec<Value> {
    if is_join(request) {
        return vec![response_to(
            request,
            json!({"stage": "FreeUserConnect", "step": 0, "max_steps": 12}),
        )];
    }
    match request["type"].as_str() {
        Some("get-companies") => vec![response_to(
            request,
            json!([{"id": 1, "name": "Alpha"}, {"id": 2, "name": "Beta"}]),
        )],
        Some("get-cities") => vec![response_to(request, json!({"cities": [{"id": 7}]}))],
        Some("ping") => vec![json!({"type": "error", "message": "slow down"})],
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn test_connect_sets_flags_and_client_id() {
    let server = MockGameServer::silent().await;

    let client = ClientBuilder::new(server.url())
        .instance_id("itest")
        .connect()
        .await
        .unwrap();

    assert!(client.is_connected().await);
    let state = client.snapshot().await;
    assert!(state.connected);
    assert!(!state.connecting);
    assert_eq!(server.paths(), vec!["/ws?client_id=itest".to_string()]);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_companies_round_trip_updates_cache() {
    let mut server = MockGameServer::with_handler(game_server_reply).await;
    let client = ClientBuilder::new(server.url()).connect().await.unwrap();

    let data = client.get_companies().await.unwrap();
    assert_eq!(data.as_array().map(Vec::len), Some(2));

    let sent = server.next_of_type("get-companies").await.unwrap();
    assert!(sent["request_id"].as_str().unwrap().starts_with("get_companies_"));
    assert_eq!(client.snapshot().await.companies[1]["name"], "Beta");
    assert_eq!(client.pending_requests().await, 0);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_error_frame_sets_last_error() {
    let server = MockGameServer::with_handler(game_server_reply).await;
    let client = ClientBuilder::new(server.url()).connect().await.unwrap();
    let mut events = client.subscribe();

    client.ping().await.unwrap();

    let reported = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::Error(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reported, "Server error: slow down");
    assert_eq!(
        client.snapshot().await.last_error.as_deref(),
        Some("Server error: slow down")
    );

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_session_request_without_session_is_rejected() {
    let mut server = MockGameServer::silent().await;
    let client = ClientBuilder::new(server.url()).connect().await.unwrap();

    let result = client.get_session().await;
    assert!(matches!(result, Err(Error::NoActiveSession)));
    assert!(server.drain().is_empty());

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_push_burst_collapses_into_one_refresh() {
    let mut server = MockGameServer::with_handler(game_server_reply).await;
    let client = ClientBuilder::new(server.url())
        .debounce_window(Duration::from_millis(200))
        .connect()
        .await
        .unwrap();

    client.join_session("AB12CD").await.unwrap();
    assert_eq!(
        client.snapshot().await.session.id.as_deref(),
        Some("AB12CD")
    );

    // Let the post-join batch go out before counting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.drain();

    for _ in 0..3 {
        server.push("api-city-create", json!({"city_id": 7}));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    let refreshes: Vec<Value> = server
        .drain()
        .into_iter()
        .filter(|f| f["type"] == "get-cities")
        .collect();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0]["session_id"], "AB12CD");
    assert_eq!(client.snapshot().await.cities, vec![json!({"id": 7})]);
    assert!(client.request_stats().await.debounced >= 2);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_legacy_event_push_refetches_event() {
    let mut server = MockGameServer::with_handler(game_server_reply).await;
    let client = ClientBuilder::new(server.url()).connect().await.unwrap();

    client.join_session("AB12CD").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.drain();

    server.push(LEGACY_EVENT_PUSH, Value::Null);

    let refetch = server.next_of_type("get-session-event").await.unwrap();
    assert_eq!(refetch["session_id"], "AB12CD");
    assert!(refetch["request_id"]
        .as_str()
        .unwrap()
        .starts_with("get_session_event_"));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_push_is_surfaced_to_listeners() {
    let server = MockGameServer::silent().await;
    let client = ClientBuilder::new(server.url()).connect().await.unwrap();
    let mut events = client.subscribe();

    server.push("api-custom_banner", json!({"text": "hello"}));

    let (topic, data) = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::Push { topic, data }) = events.recv().await {
                return (topic, data);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(topic, "api-custom_banner");
    assert_eq!(data, Some(json!({"text": "hello"})));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_refuses_sends_and_stays_down() {
    let server = MockGameServer::silent().await;
    let client = ClientBuilder::new(server.url()).connect().await.unwrap();

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(!client.snapshot().await.connected);

    let result = client.request(RequestKind::Companies, Map::new()).await;
    assert!(matches!(result, Err(Error::ChannelNotOpen)));
    assert_eq!(
        client.snapshot().await.last_error.as_deref(),
        Some("WebSocket is not connected")
    );

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(server.connections(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pending_request_fails_when_channel_drops() {
    let server = MockGameServer::silent().await;
    let client = ClientBuilder::new(server.url())
        .with_reconnect(Box::new(NoReconnect))
        .connect()
        .await
        .unwrap();

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.request(RequestKind::Users, Map::new()).await })
    };
    assert!(wait_until(|| async { client.pending_requests().await == 1 }).await);

    server.drop_connections();

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::TransportClosed)));
    assert_eq!(client.pending_requests().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_first_attempt_failure_is_reported() {
    let client = ClientBuilder::new("ws://127.0.0.1:1/ws")
        .with_reconnect(Box::new(NoReconnect))
        .build()
        .unwrap();

    let result = client.connect().await;
    assert!(matches!(result, Err(Error::WebSocket(_))));

    assert!(
        wait_until(|| async {
            client.snapshot().await.last_error.as_deref() == Some("Reconnection abandoned")
        })
        .await
    );
    let state = client.snapshot().await;
    assert!(!state.connected);
    assert!(!state.connecting);
}
