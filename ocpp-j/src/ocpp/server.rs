//! OCPP WebSocket server (CSMS role)
//!
//! Accepts station connections on `<base_path>/<identity>`, gates the
//! upgrade on subprotocol and credentials, and serves each socket from its
//! own task. Outbound traffic reaches a socket only through the
//! [`ConnectionRegistry`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderMap, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::dispatcher::{CommandInfo, Dispatcher, Event};
use super::intent::{Control, Intent, Receipt};
use super::messages::{Call, ErrorCode, OcppMessage, OCPP_SUBPROTOCOL};
use super::registry::{ConnectionHandle, ConnectionInfo, ConnectionRegistry, Outbound};
use super::schema::SchemaRegistry;
use crate::config::CsmsConfig;
use crate::error::OcppError;

/// Decides whether a station may complete its upgrade
pub trait Authenticator: Send + Sync {
    /// `authorization` is the raw `Authorization` header, if any
    fn authenticate(&self, identity: &str, authorization: Option<&str>) -> bool;
}

/// HTTP basic auth against a fixed credential map; an empty map admits everyone
#[derive(Debug, Clone, Default)]
pub struct BasicAuth {
    users: HashMap<String, String>,
}

impl BasicAuth {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, identity: &str, authorization: Option<&str>) -> bool {
        if self.users.is_empty() {
            return true;
        }

        let Some(encoded) = authorization.and_then(|h| h.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };

        match credentials.split_once(':') {
            Some((user, password)) => {
                user == identity && self.users.get(user).map(String::as_str) == Some(password)
            }
            None => false,
        }
    }
}

/// Station identity: the single path segment after `base_path`
fn station_from_path<'a>(base_path: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(base_path.trim_end_matches('/'))?;
    let identity = rest.strip_prefix('/')?.trim_end_matches('/');
    if identity.is_empty() || identity.contains('/') {
        None
    } else {
        Some(identity)
    }
}

fn offers_ocpp(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == OCPP_SUBPROTOCOL)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    if status == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"OCPP\""),
        );
    }
    response
}

struct Shared {
    config: CsmsConfig,
    dispatcher: Dispatcher,
    registry: ConnectionRegistry,
    events: mpsc::Sender<Event>,
    auth: Arc<dyn Authenticator>,
}

impl Shared {
    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// CSMS accept loop
pub struct CsmsServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

/// Cloneable handle for addressing connected stations
#[derive(Clone)]
pub struct CsmsHandle {
    dispatcher: Dispatcher,
    registry: ConnectionRegistry,
}

impl CsmsServer {
    /// Bind the listener, authenticating with [`BasicAuth`] over `config.users`
    pub async fn bind(
        config: CsmsConfig,
        schemas: Arc<SchemaRegistry>,
    ) -> Result<(Self, CsmsHandle, mpsc::Receiver<Event>), OcppError> {
        let auth = Arc::new(BasicAuth::new(config.users.clone()));
        Self::bind_with_auth(config, schemas, auth).await
    }

    pub async fn bind_with_auth(
        config: CsmsConfig,
        schemas: Arc<SchemaRegistry>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<(Self, CsmsHandle, mpsc::Receiver<Event>), OcppError> {
        let listener = TcpListener::bind(config.listen).await?;
        let dispatcher = Dispatcher::new(schemas, config.message_timeout, config.reply_call_errors);
        let registry = ConnectionRegistry::new();
        let (event_tx, event_rx) = mpsc::channel(256);

        let handle = CsmsHandle {
            dispatcher: dispatcher.clone(),
            registry: registry.clone(),
        };
        let shared = Arc::new(Shared {
            config,
            dispatcher,
            registry,
            events: event_tx,
            auth,
        });

        Ok((Self { listener, shared }, handle, event_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, OcppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<(), OcppError> {
        info!(
            "CSMS listening on {}{}/<station>",
            self.local_addr()?,
            self.shared.config.base_path
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        serve_connection(shared, stream, peer).await;
                    });
                }
                Err(e) => error!("Accept failed: {}", e),
            }
        }
    }
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let mut identity: Option<String> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let station = station_from_path(&shared.config.base_path, request.uri().path())
            .ok_or_else(|| reject(StatusCode::NOT_FOUND, "unknown path"))?;

        if !offers_ocpp(request.headers()) {
            return Err(reject(StatusCode::BAD_REQUEST, "subprotocol ocpp2.0.1 required"));
        }

        let authorization = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !shared.auth.authenticate(station, authorization) {
            return Err(reject(StatusCode::UNAUTHORIZED, "invalid credentials"));
        }

        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        identity = Some(station.to_string());
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(1024 * 1024),
        max_frame_size: Some(256 * 1024),
        ..Default::default()
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Rejected connection from {}: {}", peer, e);
            return;
        }
    };
    let Some(identity) = identity else {
        return;
    };

    info!("Station {} connected from {}", identity, peer);
    let (handle, mut outbound) = ConnectionHandle::new(64);
    if let Some(orphan) = shared.registry.on_upgrade(&identity, handle.clone()) {
        orphan.close();
    }
    shared
        .emit(Event::Connections {
            count: shared.registry.count(),
        })
        .await;

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("[{}] Dropping non UTF-8 binary frame", identity);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("[{}] Closed by station: {:?}", identity, frame);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("[{}] WebSocket error: {}", identity, e);
                        break;
                    }
                    None => break,
                };

                debug!("[{}] Received: {}", identity, text);
                match shared.dispatcher.handle_inbound(&identity, &text) {
                    Ok(event) => shared.emit(event).await,
                    Err(rejection) => {
                        if let Some(reply) = rejection.reply.clone() {
                            let text = OcppMessage::CallError(reply).to_text();
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!("[{}] Failed to send CALLERROR: {}", identity, e);
                                break;
                            }
                        }
                        if !rejection.error.is_framing() {
                            shared.emit(rejection.to_event(&identity)).await;
                        }
                    }
                }
            }

            outgoing = outbound.recv() => match outgoing {
                Some(Outbound::Frame(text)) => {
                    debug!("[{}] Sending: {}", identity, text);
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!("[{}] Send failed: {}", identity, e);
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    info!("[{}] Closing connection #{}", identity, handle.id());
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }

    if shared.registry.on_close(&identity, handle.id()) {
        shared
            .emit(Event::Connections {
                count: shared.registry.count(),
            })
            .await;
    }
}

impl CsmsHandle {
    /// Send a CALL to `station`, returning its message id
    pub async fn call(
        &self,
        station: &str,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<String, OcppError> {
        self.call_with(station, Call::new(action, payload), None).await
    }

    pub async fn call_with(
        &self,
        station: &str,
        call: Call,
        origin: Option<String>,
    ) -> Result<String, OcppError> {
        let connection = self.registry.route(station)?;
        let text = self.dispatcher.prepare_call(station, &call, origin)?;

        if let Err(e) = connection.send_frame(text).await {
            self.dispatcher.cancel_call(station, &call.message_id);
            return Err(e);
        }
        Ok(call.message_id)
    }

    /// Answer the station's CALL `message_id`
    pub async fn reply(&self, station: &str, message_id: &str, payload: Value) -> Result<(), OcppError> {
        let connection = self.registry.route(station)?;
        let text = self.dispatcher.prepare_result(station, message_id, payload)?;
        connection.send_frame(text).await
    }

    pub async fn reply_error(
        &self,
        station: &str,
        message_id: &str,
        code: ErrorCode,
        description: &str,
        details: Value,
    ) -> Result<(), OcppError> {
        let connection = self.registry.route(station)?;
        let text = self
            .dispatcher
            .prepare_error(station, message_id, code, description, details)?;
        connection.send_frame(text).await
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    pub fn commands(&self) -> Vec<CommandInfo> {
        self.dispatcher.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    pub fn watch_connections(&self) -> watch::Receiver<usize> {
        self.registry.subscribe()
    }

    /// Submit any application intent; wire intents must name a station
    pub async fn submit(&self, intent: Intent) -> Result<Receipt, OcppError> {
        if let Intent::Control(control) = intent {
            return self.control(control);
        }
        let station = intent
            .station()
            .map(str::to_string)
            .ok_or_else(|| OcppError::InvalidIntent("cbId is required".into()))?;

        match intent {
            Intent::Call { action, payload, message_id, origin, .. } => {
                let call = match message_id {
                    Some(id) => Call::with_id(id, action, payload),
                    None => Call::new(action, payload),
                };
                let message_id = self.call_with(&station, call, origin).await?;
                Ok(Receipt::Sent { message_id })
            }
            Intent::Reply { message_id, payload, .. } => {
                self.reply(&station, &message_id, payload).await?;
                Ok(Receipt::Sent { message_id })
            }
            Intent::Error { message_id, code, description, details, .. } => {
                self.reply_error(&station, &message_id, code, &description, details)
                    .await?;
                Ok(Receipt::Sent { message_id })
            }
            Intent::Control(_) => Ok(Receipt::Done),
        }
    }

    fn control(&self, control: Control) -> Result<Receipt, OcppError> {
        match control {
            Control::Connections => Ok(Receipt::Connections {
                connections: self.connections(),
            }),
            Control::Commands => Ok(Receipt::Commands {
                commands: self.commands(),
            }),
            Control::Connect(_) | Control::Close => Err(OcppError::InvalidIntent(
                "connect and close are only available on a charging station".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_from_path() {
        assert_eq!(station_from_path("/ocpp", "/ocpp/CS001"), Some("CS001"));
        assert_eq!(station_from_path("/ocpp/", "/ocpp/CS001/"), Some("CS001"));
        assert_eq!(station_from_path("", "/CS001"), Some("CS001"));
        assert_eq!(station_from_path("/ocpp", "/ocpp"), None);
        assert_eq!(station_from_path("/ocpp", "/ocpp/"), None);
        assert_eq!(station_from_path("/ocpp", "/other/CS001"), None);
        assert_eq!(station_from_path("/ocpp", "/ocppX/CS001"), None);
        assert_eq!(station_from_path("/ocpp", "/ocpp/a/b"), None);
    }

    #[test]
    fn test_offers_ocpp() {
        let mut headers = HeaderMap::new();
        assert!(!offers_ocpp(&headers));

        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("ocpp1.6, ocpp2.0.1"),
        );
        assert!(offers_ocpp(&headers));

        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp1.6"));
        assert!(!offers_ocpp(&headers));
    }

    #[test]
    fn test_basic_auth() {
        let open = BasicAuth::default();
        assert!(open.authenticate("CS001", None));

        let mut users = HashMap::new();
        users.insert("CS001".to_string(), "secret".to_string());
        let auth = BasicAuth::new(users);

        let good = format!("Basic {}", BASE64_STANDARD.encode("CS001:secret"));
        let wrong_password = format!("Basic {}", BASE64_STANDARD.encode("CS001:nope"));
        let wrong_user = format!("Basic {}", BASE64_STANDARD.encode("CS002:secret"));

        assert!(auth.authenticate("CS001", Some(&good)));
        assert!(!auth.authenticate("CS001", Some(&wrong_password)));
        assert!(!auth.authenticate("CS001", Some(&wrong_user)));
        assert!(!auth.authenticate("CS002", Some(&good)));
        assert!(!auth.authenticate("CS001", None));
        assert!(!auth.authenticate("CS001", Some("Bearer abc")));
    }

    #[test]
    fn test_reject_sets_status() {
        let response = reject(StatusCode::UNAUTHORIZED, "invalid credentials");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(response.body().as_deref(), Some("invalid credentials"));
    }
}
