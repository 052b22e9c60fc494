//! OCPP WebSocket client (charging station role)
//!
//! Owns one logical connection to a CSMS and drives it through
//! `Disconnected → Connecting → Open → Closing → ReconnectWait → Connecting`.
//! Handles:
//! - WebSocket connection with the `ocpp2.0.1` subprotocol and basic auth
//! - Linear reconnect backoff, reset on every successful open
//! - Keepalive pings while open
//! - `connect` / `close` control commands
//!
//! Each physical socket lives in its own [`Link`], created on connect and
//! dropped on close, so no per-socket state survives a reconnect.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::dispatcher::{CommandInfo, Dispatcher, Event};
use super::intent::{ConnectParams, Control, Intent, Receipt};
use super::messages::{Call, ErrorCode, OcppMessage, OCPP_SUBPROTOCOL};
use super::schema::SchemaRegistry;
use crate::config::{BackoffConfig, StationConfig};
use crate::error::OcppError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Online/offline as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkStatus {
    Online,
    Offline,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    ReconnectWait,
}

/// Reconnect wait tracker
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Wait before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.config.increment).min(self.config.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.min;
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

struct Command {
    intent: Intent,
    ack: oneshot::Sender<Result<Receipt, OcppError>>,
}

/// One physical socket
struct Link {
    url: String,
    ws: WsStream,
}

/// How a link's drive loop ended
enum LinkEnd {
    /// Socket closed or failed; reconnect per backoff unless told not to
    Lost,
    /// `connect` command: reconnect immediately
    Reconnect,
    /// `close` command
    Stopped,
    /// Every handle was dropped
    Shutdown,
}

/// What the run loop should do after an idle period
enum Wake {
    Connect,
    Shutdown,
}

/// Charging station client
pub struct StationClient {
    config: StationConfig,
    dispatcher: Dispatcher,
    backoff: Backoff,
    no_reconnect: bool,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<Event>,
    status: watch::Sender<LinkStatus>,
    state: watch::Sender<ConnectionState>,
}

/// Cloneable handle for submitting work to a running [`StationClient`]
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<LinkStatus>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Dispatcher,
}

impl StationClient {
    /// Create a client plus its handle and event stream
    pub fn new(
        config: StationConfig,
        schemas: Arc<SchemaRegistry>,
    ) -> (Self, ClientHandle, mpsc::Receiver<Event>) {
        let dispatcher = Dispatcher::new(schemas, config.message_timeout, config.reply_call_errors);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Offline);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let handle = ClientHandle {
            commands: command_tx,
            status: status_rx,
            state: state_rx,
            dispatcher: dispatcher.clone(),
        };

        let client = Self {
            backoff: Backoff::new(config.backoff),
            config,
            dispatcher,
            no_reconnect: false,
            commands: command_rx,
            events: event_tx,
            status: status_tx,
            state: state_tx,
        };

        (client, handle, event_rx)
    }

    /// Run the connection loop until every handle is dropped
    pub async fn run(mut self) -> Result<(), OcppError> {
        let mut connect_now = self.config.auto_connect;

        loop {
            let wait = if connect_now {
                let end = match self.connect().await {
                    Ok(link) => self.serve(link).await,
                    Err(end) => end,
                };
                match end {
                    LinkEnd::Lost => self.schedule_retry(),
                    LinkEnd::Reconnect => continue,
                    LinkEnd::Stopped => None,
                    LinkEnd::Shutdown => break,
                }
            } else {
                None
            };

            match self.idle(wait).await {
                Wake::Connect => connect_now = true,
                Wake::Shutdown => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Station client {} stopped", self.config.station_id);
        Ok(())
    }

    fn schedule_retry(&mut self) -> Option<Duration> {
        if self.no_reconnect {
            return None;
        }
        let delay = self.backoff.next_delay();
        info!("Reconnecting in {:?}", delay);
        Some(delay)
    }

    /// Open a link, answering commands while the handshake is in flight
    async fn connect(&mut self) -> Result<Link, LinkEnd> {
        self.set_state(ConnectionState::Connecting);

        let (params, ack) = {
            let attempt = open_link(&self.config);
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    result = &mut attempt => {
                        return result.map_err(|e| {
                            error!("Connection to CSMS failed: {}", e);
                            LinkEnd::Lost
                        });
                    }
                    command = self.commands.recv() => {
                        let Some(Command { intent, ack }) = command else {
                            return Err(LinkEnd::Shutdown);
                        };
                        match intent {
                            Intent::Control(Control::Connect(params)) => break (params, ack),
                            Intent::Control(Control::Close) => {
                                info!("Connection attempt abandoned, auto-reconnect disabled");
                                self.no_reconnect = true;
                                let _ = ack.send(Ok(Receipt::Done));
                                return Err(LinkEnd::Stopped);
                            }
                            other => {
                                let _ = ack.send(self.answer_offline(other));
                            }
                        }
                    }
                }
            }
        };

        // The abandoned handshake is dropped before the target changes
        self.reconfigure(params);
        self.no_reconnect = false;
        let _ = ack.send(Ok(Receipt::Done));
        Err(LinkEnd::Reconnect)
    }

    /// Drive one open socket until it ends
    async fn serve(&mut self, link: Link) -> LinkEnd {
        self.backoff.reset();
        self.set_state(ConnectionState::Open);
        self.set_status(LinkStatus::Online).await;

        let Link { url, ws } = link;
        let (mut sink, mut stream) = ws.split();

        // interval_at panics on a zero period
        let period = self.config.ping_interval.max(Duration::from_millis(100));
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.on_frame(&mut sink, &text).await {
                            error!("Failed to answer CSMS: {}", e);
                            break LinkEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if let Err(e) = self.on_frame(&mut sink, &text).await {
                                error!("Failed to answer CSMS: {}", e);
                                break LinkEnd::Lost;
                            }
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed by CSMS: {:?}", frame);
                        break LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break LinkEnd::Lost;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break LinkEnd::Lost;
                    }
                },

                _ = keepalive.tick() => {
                    debug!("Sending keepalive ping to {}", url);
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        error!("Keepalive ping failed: {}", e);
                        break LinkEnd::Lost;
                    }
                }

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(end) = self.on_command(&mut sink, command).await {
                            break end;
                        }
                    }
                    None => break LinkEnd::Shutdown,
                },
            }
        };

        self.set_state(ConnectionState::Closing);
        if let Err(e) = sink.close().await {
            debug!("Closing {} returned: {}", url, e);
        }
        self.set_status(LinkStatus::Offline).await;
        info!("Connection to {} closed", url);
        end
    }

    async fn on_frame(&mut self, sink: &mut WsSink, text: &str) -> Result<(), OcppError> {
        debug!("Received: {}", text);
        match self.dispatcher.handle_inbound(&self.config.station_id, text) {
            Ok(event) => self.emit(event).await,
            Err(rejection) => {
                if let Some(reply) = rejection.reply.clone() {
                    let text = OcppMessage::CallError(reply).to_text();
                    sink.send(Message::Text(text))
                        .await
                        .map_err(|e| OcppError::Connection(e.to_string()))?;
                }
                if !rejection.error.is_framing() {
                    self.emit(rejection.to_event(&self.config.station_id)).await;
                }
            }
        }
        Ok(())
    }

    /// Handle an application command while open; `Some` ends the link
    async fn on_command(&mut self, sink: &mut WsSink, command: Command) -> Option<LinkEnd> {
        let Command { intent, ack } = command;
        let station = self.config.station_id.clone();

        let (result, end) = match intent {
            Intent::Control(control) => match self.on_control(control) {
                Ok((receipt, end)) => (Ok(receipt), end),
                Err(e) => (Err(e), None),
            },
            Intent::Call { action, payload, message_id, origin, .. } => {
                let call = match message_id {
                    Some(id) => Call::with_id(id, action, payload),
                    None => Call::new(action, payload),
                };
                match self.dispatcher.prepare_call(&station, &call, origin) {
                    Ok(text) => match send_text(sink, text).await {
                        Ok(()) => (
                            Ok(Receipt::Sent { message_id: call.message_id }),
                            None,
                        ),
                        Err(e) => {
                            self.dispatcher.cancel_call(&station, &call.message_id);
                            (Err(e), Some(LinkEnd::Lost))
                        }
                    },
                    Err(e) => (Err(e), None),
                }
            }
            Intent::Reply { message_id, payload, .. } => {
                match self.dispatcher.prepare_result(&station, &message_id, payload) {
                    Ok(text) => sent(send_text(sink, text).await, message_id),
                    Err(e) => (Err(e), None),
                }
            }
            Intent::Error { message_id, code, description, details, .. } => {
                match self
                    .dispatcher
                    .prepare_error(&station, &message_id, code, &description, details)
                {
                    Ok(text) => sent(send_text(sink, text).await, message_id),
                    Err(e) => (Err(e), None),
                }
            }
        };

        if let Err(ref e) = result {
            warn!("[{}] Request failed: {}", station, e);
        }
        let _ = ack.send(result);
        end
    }

    /// Apply a control command; the second element ends the current link
    fn on_control(&mut self, control: Control) -> Result<(Receipt, Option<LinkEnd>), OcppError> {
        match control {
            Control::Connect(params) => {
                self.reconfigure(params);
                self.no_reconnect = false;
                Ok((Receipt::Done, Some(LinkEnd::Reconnect)))
            }
            Control::Close => {
                info!("Closing connection, auto-reconnect disabled");
                self.no_reconnect = true;
                Ok((Receipt::Done, Some(LinkEnd::Stopped)))
            }
            Control::Commands => Ok((
                Receipt::Commands {
                    commands: self.dispatcher.snapshot(),
                },
                None,
            )),
            Control::Connections => Err(OcppError::InvalidIntent(
                "connections is only available on a CSMS".into(),
            )),
        }
    }

    fn reconfigure(&mut self, params: ConnectParams) {
        if let Some(station_id) = params.station_id {
            self.config.station_id = station_id;
        }
        if let Some(password) = params.password {
            self.config.password = Some(password);
        }
        if let Some(url) = params.csms_url {
            self.config.csms_url = url;
        }
        self.backoff.reset();
    }

    /// Wait for the reconnect timer or a command that ends the wait
    async fn idle(&mut self, wait: Option<Duration>) -> Wake {
        self.set_state(match wait {
            Some(_) => ConnectionState::ReconnectWait,
            None => ConnectionState::Disconnected,
        });

        let mut timer = wait.map(|delay| Box::pin(tokio::time::sleep(delay)));

        loop {
            let expired = async {
                match timer.as_mut() {
                    Some(sleep) => sleep.await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = expired => return Wake::Connect,
                command = self.commands.recv() => {
                    let Some(Command { intent, ack }) = command else {
                        return Wake::Shutdown;
                    };

                    let result = match intent {
                        Intent::Control(Control::Connect(params)) => {
                            self.reconfigure(params);
                            self.no_reconnect = false;
                            let _ = ack.send(Ok(Receipt::Done));
                            return Wake::Connect;
                        }
                        Intent::Control(Control::Close) => {
                            self.no_reconnect = true;
                            timer = None;
                            self.set_state(ConnectionState::Disconnected);
                            Ok(Receipt::Done)
                        }
                        other => self.answer_offline(other),
                    };
                    let _ = ack.send(result);
                }
            }
        }
    }

    /// Answer a command that needs no open link
    fn answer_offline(&self, intent: Intent) -> Result<Receipt, OcppError> {
        match intent {
            Intent::Control(Control::Commands) => Ok(Receipt::Commands {
                commands: self.dispatcher.snapshot(),
            }),
            Intent::Control(Control::Connections) => Err(OcppError::InvalidIntent(
                "connections is only available on a CSMS".into(),
            )),
            _ => Err(OcppError::NotConnected {
                station: self.config.station_id.clone(),
            }),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    /// Publish a status change once; repeated identical statuses are dropped
    async fn set_status(&self, status: LinkStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            info!("Station {} is {:?}", self.config.station_id, status);
            self.emit(Event::Status {
                station: self.config.station_id.clone(),
                status,
            })
            .await;
        }
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

async fn open_link(config: &StationConfig) -> Result<Link, OcppError> {
    let url = build_ocpp_url(&config.csms_url, &config.station_id);
    info!("Connecting to CSMS: {}", url);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| OcppError::Connection(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OCPP_SUBPROTOCOL),
    );
    if let Some(ref password) = config.password {
        let token = BASE64_STANDARD.encode(format!("{}:{}", config.station_id, password));
        let value = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|e| OcppError::Connection(e.to_string()))?;
        headers.insert(header::AUTHORIZATION, value);
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(1024 * 1024),
        max_frame_size: Some(256 * 1024),
        ..Default::default()
    };

    let (ws, response) = tokio::time::timeout(
        config.connect_timeout,
        connect_async_with_config(request, Some(ws_config), false),
    )
    .await
    .map_err(|_| {
        OcppError::Connection(format!(
            "handshake timed out after {:?}",
            config.connect_timeout
        ))
    })?
    .map_err(|e| OcppError::Connection(e.to_string()))?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(OCPP_SUBPROTOCOL) {
        return Err(OcppError::Handshake(format!(
            "CSMS did not accept {}, got {:?}",
            OCPP_SUBPROTOCOL, accepted
        )));
    }

    info!("WebSocket connected to {}", url);
    Ok(Link { url, ws })
}

async fn send_text(sink: &mut WsSink, text: String) -> Result<(), OcppError> {
    debug!("Sending: {}", text);
    sink.send(Message::Text(text))
        .await
        .map_err(|e| OcppError::Connection(e.to_string()))
}

fn sent(
    outcome: Result<(), OcppError>,
    message_id: String,
) -> (Result<Receipt, OcppError>, Option<LinkEnd>) {
    match outcome {
        Ok(()) => (Ok(Receipt::Sent { message_id }), None),
        Err(e) => (Err(e), Some(LinkEnd::Lost)),
    }
}

impl ClientHandle {
    /// Submit any application intent
    pub async fn submit(&self, intent: Intent) -> Result<Receipt, OcppError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command { intent, ack })
            .await
            .map_err(|_| OcppError::ConnectionClosed)?;
        rx.await.map_err(|_| OcppError::ConnectionClosed)?
    }

    /// Send a CALL, returning its message id
    pub async fn call(&self, action: impl Into<String>, payload: Value) -> Result<String, OcppError> {
        self.call_with(Call::new(action, payload), None).await
    }

    /// Send a prepared CALL with an optional origin token
    pub async fn call_with(&self, call: Call, origin: Option<String>) -> Result<String, OcppError> {
        let intent = Intent::Call {
            station: None,
            action: call.action,
            payload: call.payload,
            message_id: Some(call.message_id),
            origin,
        };
        expect_sent(self.submit(intent).await?)
    }

    /// Answer a CSMS request
    pub async fn reply(&self, message_id: impl Into<String>, payload: Value) -> Result<(), OcppError> {
        let intent = Intent::Reply {
            station: None,
            message_id: message_id.into(),
            payload,
        };
        expect_sent(self.submit(intent).await?).map(|_| ())
    }

    /// Answer a CSMS request with a CALLERROR
    pub async fn reply_error(
        &self,
        message_id: impl Into<String>,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Result<(), OcppError> {
        let intent = Intent::Error {
            station: None,
            message_id: message_id.into(),
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        };
        expect_sent(self.submit(intent).await?).map(|_| ())
    }

    pub async fn control(&self, control: Control) -> Result<Receipt, OcppError> {
        self.submit(Intent::Control(control)).await
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), OcppError> {
        let mut rx = self.state.clone();
        while *rx.borrow_and_update() != state {
            rx.changed().await.map_err(|_| OcppError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Requests in flight in both directions
    pub fn pending(&self) -> Vec<CommandInfo> {
        self.dispatcher.snapshot()
    }
}

fn expect_sent(receipt: Receipt) -> Result<String, OcppError> {
    match receipt {
        Receipt::Sent { message_id } => Ok(message_id),
        other => Err(OcppError::InvalidIntent(format!("unexpected receipt {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:9220/ocpp", "CS001");
        assert_eq!(url, "ws://localhost:9220/ocpp/CS001");

        let url = build_ocpp_url("ws://localhost:9220/ocpp/", "CS001");
        assert_eq!(url, "ws://localhost:9220/ocpp/CS001");
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 15, 20]);

        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(360));
        assert_eq!(backoff.current(), Duration::from_secs(360));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_link_status_serialization() {
        assert_eq!(serde_json::to_value(LinkStatus::Online).unwrap(), json!("ONLINE"));
        assert_eq!(serde_json::to_value(LinkStatus::Offline).unwrap(), json!("OFFLINE"));
    }

    fn idle_client() -> (StationClient, ClientHandle, mpsc::Receiver<Event>) {
        let config = StationConfig::new("ws://127.0.0.1:1/ocpp", "CS001").without_auto_connect();
        StationClient::new(config, Arc::new(SchemaRegistry::new()))
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_rejected() {
        let (client, handle, _events) = idle_client();
        tokio::spawn(client.run());

        let result = handle.call("Heartbeat", json!({})).await;
        assert!(matches!(result, Err(OcppError::NotConnected { station }) if station == "CS001"));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.status(), LinkStatus::Offline);
        assert!(handle.pending().is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_scheduled_reconnect() {
        let config = StationConfig::new("ws://127.0.0.1:1/ocpp", "CS001")
            .with_connect_timeout(Duration::from_millis(500));
        let (client, handle, _events) = StationClient::new(config, Arc::new(SchemaRegistry::new()));
        tokio::spawn(client.run());

        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for_state(ConnectionState::ReconnectWait),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(handle.control(Control::Close).await.unwrap(), Receipt::Done);
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        // Only connections are CSMS-only
        assert!(handle.control(Control::Connections).await.is_err());
        assert!(matches!(
            handle.control(Control::Commands).await.unwrap(),
            Receipt::Commands { .. }
        ));
    }

    #[tokio::test]
    async fn test_commands_are_answered_while_connecting() {
        // Accepts TCP but never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ocpp", listener.local_addr().unwrap());
        let config =
            StationConfig::new(&url, "CS001").with_connect_timeout(Duration::from_secs(30));
        let (client, handle, _events) = StationClient::new(config, Arc::new(SchemaRegistry::new()));
        tokio::spawn(client.run());

        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for_state(ConnectionState::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle.call("Heartbeat", json!({})))
            .await
            .unwrap();
        assert!(matches!(result, Err(OcppError::NotConnected { .. })));
        assert!(handle.pending().is_empty());

        assert_eq!(handle.control(Control::Close).await.unwrap(), Receipt::Done);
        tokio::time::timeout(
            Duration::from_secs(1),
            handle.wait_for_state(ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_handles_drop() {
        let (client, handle, _events) = idle_client();
        let task = tokio::spawn(client.run());
        drop(handle);

        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
