//! End-to-end tests: a real CSMS and real stations on a loopback port

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header, HeaderValue},
    Message,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ocpp_j::ocpp::ConnectParams;
use ocpp_j::{
    BackoffConfig, Call, ClientHandle, ConnectionState, Control, CsmsConfig, CsmsHandle,
    CsmsServer, Event, LinkStatus, OcppError, Receipt, SchemaRegistry, StationClient,
    StationConfig,
};

const WAIT: Duration = Duration::from_secs(5);

fn schemas() -> Arc<SchemaRegistry> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("schemas");
    Arc::new(SchemaRegistry::from_dir(dir).unwrap())
}

async fn start_csms(config: CsmsConfig) -> (String, CsmsHandle, mpsc::Receiver<Event>) {
    let (server, handle, events) = CsmsServer::bind(config, schemas()).await.unwrap();
    let url = format!("ws://{}/ocpp", server.local_addr().unwrap());
    tokio::spawn(server.run());
    (url, handle, events)
}

fn csms_config() -> CsmsConfig {
    CsmsConfig::new("127.0.0.1:0".parse().unwrap()).with_base_path("/ocpp")
}

/// Station config that will not retry within the test's lifetime
fn station_config(url: &str, station: &str) -> StationConfig {
    StationConfig::new(url, station).with_backoff(BackoffConfig::new(
        Duration::from_secs(60),
        Duration::from_secs(60),
        Duration::from_secs(0),
    ))
}

async fn next_event<F>(events: &mut mpsc::Receiver<Event>, mut matches: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Station config that retries after 100ms, then far beyond the test's lifetime
fn quick_retry_config(url: &str, station: &str) -> StationConfig {
    StationConfig::new(url, station).with_backoff(BackoffConfig::new(
        Duration::from_millis(100),
        Duration::from_secs(60),
        Duration::from_secs(30),
    ))
}

async fn next_status(events: &mut mpsc::Receiver<Event>) -> LinkStatus {
    match next_event(events, |e| matches!(e, Event::Status { .. })).await {
        Event::Status { status, .. } => status,
        _ => unreachable!(),
    }
}

/// Round trip a Heartbeat so the CSMS is known to be serving this connection
async fn settle(station: &ClientHandle, csms_events: &mut mpsc::Receiver<Event>) {
    let id = station.call("Heartbeat", json!({})).await.unwrap();
    next_event(csms_events, |e| {
        matches!(e, Event::Request { message_id, .. } if *message_id == id)
    })
    .await;
}

/// Open a bare socket under `station`, displacing the connection holding that identity
async fn displace(url: &str, station: &str) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let mut request = format!("{}/{}", url, station).into_client_request().unwrap();
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("ocpp2.0.1"),
    );
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

#[tokio::test]
async fn test_heartbeat_round_trip() {
    let (url, csms, mut csms_events) = start_csms(csms_config()).await;

    let (client, station, mut station_events) =
        StationClient::new(station_config(&url, "CS001"), schemas());
    tokio::spawn(client.run());

    let online = next_event(&mut station_events, |e| matches!(e, Event::Status { .. })).await;
    assert!(matches!(online, Event::Status { status: LinkStatus::Online, .. }));
    assert_eq!(station.state(), ConnectionState::Open);

    let id = station
        .call_with(Call::with_id("abc", "Heartbeat", json!({})), Some("flow-1".into()))
        .await
        .unwrap();
    assert_eq!(id, "abc");

    let request = next_event(&mut csms_events, |e| matches!(e, Event::Request { .. })).await;
    match request {
        Event::Request { station, message_id, action, .. } => {
            assert_eq!(station, "CS001");
            assert_eq!(message_id, "abc");
            assert_eq!(action, "Heartbeat");
        }
        _ => unreachable!(),
    }

    csms.reply("CS001", "abc", json!({"currentTime": "2024-01-01T00:00:00Z"}))
        .await
        .unwrap();

    let response = next_event(&mut station_events, |e| matches!(e, Event::Response { .. })).await;
    match response {
        Event::Response { message_id, action, payload, origin, .. } => {
            assert_eq!(message_id, "abc");
            assert_eq!(action, "Heartbeat");
            assert_eq!(payload["currentTime"], "2024-01-01T00:00:00Z");
            assert_eq!(origin.as_deref(), Some("flow-1"));
        }
        _ => unreachable!(),
    }

    assert!(station.pending().is_empty());
    assert!(csms.commands().is_empty());
}

#[tokio::test]
async fn test_invalid_reply_is_rejected_before_sending() {
    let (url, csms, mut csms_events) = start_csms(csms_config()).await;
    let (client, station, _station_events) =
        StationClient::new(station_config(&url, "CS001"), schemas());
    tokio::spawn(client.run());
    tokio::time::timeout(WAIT, station.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();

    station.call("Heartbeat", json!({})).await.unwrap();
    let request = next_event(&mut csms_events, |e| matches!(e, Event::Request { .. })).await;
    let Event::Request { message_id, .. } = request else {
        unreachable!()
    };

    let bad = csms.reply("CS001", &message_id, json!({"currentTime": 42})).await;
    assert!(matches!(bad, Err(ocpp_j::OcppError::Validation { .. })));

    let missing = csms.reply("CS002", &message_id, json!({})).await;
    assert!(matches!(missing, Err(ocpp_j::OcppError::NotConnected { .. })));
}

#[tokio::test]
async fn test_duplicate_identity_replaces_connection() {
    let (url, csms, mut csms_events) = start_csms(csms_config()).await;
    let mut counts = csms.watch_connections();

    let (first, first_handle, _first_events) =
        StationClient::new(station_config(&url, "CS001"), schemas());
    tokio::spawn(first.run());
    tokio::time::timeout(WAIT, first_handle.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(WAIT, counts.wait_for(|count| *count == 1))
        .await
        .unwrap()
        .unwrap();
    let first_id = csms.connections()[0].connection_id;

    let (second, second_handle, mut second_events) =
        StationClient::new(station_config(&url, "CS001"), schemas());
    tokio::spawn(second.run());
    tokio::time::timeout(WAIT, second_handle.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();

    // The orphaned socket is closed by the server; the first client backs off
    tokio::time::timeout(WAIT, first_handle.wait_for_state(ConnectionState::ReconnectWait))
        .await
        .unwrap()
        .unwrap();

    let connections = csms.connections();
    assert_eq!(connections.len(), 1);
    assert_ne!(connections[0].connection_id, first_id);
    assert_eq!(csms.connection_count(), 1);

    // Traffic for the identity reaches the newer connection
    csms.call("CS001", "Heartbeat", json!({})).await.unwrap();
    next_event(&mut second_events, |e| matches!(e, Event::Request { .. })).await;

    // Two upgrades, and the superseded close did not evict the record
    let mut reported = Vec::new();
    while let Ok(event) = csms_events.try_recv() {
        if let Event::Connections { count } = event {
            reported.push(count);
        }
    }
    assert_eq!(reported, vec![1, 1]);
}

#[tokio::test]
async fn test_handshake_requires_subprotocol_and_path() {
    let (url, _csms, _events) = start_csms(csms_config()).await;

    let plain = tokio_tungstenite::connect_async(format!("{}/CS009", url)).await;
    assert!(plain.is_err());

    let mut request = format!("{}/a/b", url).into_client_request().unwrap();
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("ocpp2.0.1"),
    );
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
}

#[tokio::test]
async fn test_basic_auth_gates_upgrade() {
    let (url, csms, _events) = start_csms(csms_config().with_user("CS001", "secret")).await;

    let (client, rejected, _events) = StationClient::new(
        station_config(&url, "CS001").with_password("wrong"),
        schemas(),
    );
    tokio::spawn(client.run());
    tokio::time::timeout(WAIT, rejected.wait_for_state(ConnectionState::ReconnectWait))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(csms.connection_count(), 0);

    let (client, accepted, _events) = StationClient::new(
        station_config(&url, "CS001").with_password("secret"),
        schemas(),
    );
    tokio::spawn(client.run());
    tokio::time::timeout(WAIT, accepted.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unknown_action_is_answered_with_call_error() {
    let (url, _csms, mut csms_events) = start_csms(csms_config()).await;

    let mut request = format!("{}/CS007", url).into_client_request().unwrap();
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("ocpp2.0.1"),
    );
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    let protocol = response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap();
    assert_eq!(protocol.to_str().unwrap(), "ocpp2.0.1");

    // Missing brackets are tolerated on the way in
    ws.send(Message::Text(r#"2,"1","SelfDestruct",{}"#.to_string()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return serde_json::from_str::<Value>(&text).unwrap();
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "1");
    assert_eq!(reply[2], "NotImplemented");

    let rejected = next_event(&mut csms_events, |e| matches!(e, Event::Rejected { .. })).await;
    assert!(matches!(rejected, Event::Rejected { station, .. } if station == "CS007"));
}

#[tokio::test]
async fn test_backoff_resets_after_each_open() {
    let (url, _csms, mut csms_events) = start_csms(csms_config()).await;
    let (client, station, mut station_events) =
        StationClient::new(quick_retry_config(&url, "CS001"), schemas());
    tokio::spawn(client.run());
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Online);

    // Without a reset the second retry would wait 30s and time out here
    for _ in 0..2 {
        settle(&station, &mut csms_events).await;
        let _displaced = displace(&url, "CS001").await;
        assert_eq!(next_status(&mut station_events).await, LinkStatus::Offline);
        assert_eq!(next_status(&mut station_events).await, LinkStatus::Online);
    }
    assert_eq!(station.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_status_is_reported_once_per_transition() {
    let (url, _csms, mut csms_events) = start_csms(csms_config()).await;
    let (client, station, mut station_events) =
        StationClient::new(quick_retry_config(&url, "CS001"), schemas());
    tokio::spawn(client.run());

    assert_eq!(next_status(&mut station_events).await, LinkStatus::Online);
    settle(&station, &mut csms_events).await;
    let _displaced = displace(&url, "CS001").await;
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Offline);
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Online);

    assert_eq!(station.control(Control::Close).await.unwrap(), Receipt::Done);
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Offline);
    tokio::time::timeout(WAIT, station.wait_for_state(ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = station_events.try_recv() {
        assert!(!matches!(event, Event::Status { .. }), "extra status {:?}", event);
    }
}

#[tokio::test]
async fn test_late_reply_after_reconnect_is_rejected() {
    let (url, csms, mut csms_events) = start_csms(csms_config()).await;
    let (client, station, mut station_events) = StationClient::new(
        quick_retry_config(&url, "CS001").with_message_timeout(Duration::from_millis(500)),
        schemas(),
    );
    tokio::spawn(client.run());
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Online);

    station
        .call_with(Call::with_id("x", "Heartbeat", json!({})), None)
        .await
        .unwrap();
    next_event(&mut csms_events, |e| matches!(e, Event::Request { .. })).await;

    let _displaced = displace(&url, "CS001").await;
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Offline);
    assert_eq!(next_status(&mut station_events).await, LinkStatus::Online);
    settle(&station, &mut csms_events).await;

    // The request expires on its own schedule, links come and go
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(station.pending().iter().all(|info| info.message_id != "x"));

    csms.reply("CS001", "x", json!({"currentTime": "2024-01-01T00:00:00Z"}))
        .await
        .unwrap();

    let rejected = next_event(&mut station_events, |e| {
        matches!(e, Event::Rejected { .. } | Event::Response { .. })
    })
    .await;
    match rejected {
        Event::Rejected { station, message_id, .. } => {
            assert_eq!(station, "CS001");
            assert_eq!(message_id.as_deref(), Some("x"));
        }
        other => panic!("late reply was accepted: {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_cuts_reconnect_wait_short() {
    let (url, _csms, mut csms_events) = start_csms(csms_config()).await;
    let (client, station, _station_events) =
        StationClient::new(station_config(&url, "CS001"), schemas());
    tokio::spawn(client.run());
    tokio::time::timeout(WAIT, station.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();
    settle(&station, &mut csms_events).await;

    // The 60s retry is scheduled, then skipped
    let _displaced = displace(&url, "CS001").await;
    tokio::time::timeout(WAIT, station.wait_for_state(ConnectionState::ReconnectWait))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        station.call("Heartbeat", json!({})).await,
        Err(OcppError::NotConnected { .. })
    ));

    let receipt = station
        .control(Control::Connect(ConnectParams::default()))
        .await
        .unwrap();
    assert_eq!(receipt, Receipt::Done);
    tokio::time::timeout(WAIT, station.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();
}
